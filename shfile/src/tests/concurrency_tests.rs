//! Multi-handle races. The engine is process-oriented but a handle per
//! thread exercises the same shared-region paths, so these run the
//! cross-process protocol in miniature.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crate::tests::region;
use crate::{Shf, Uid};

#[test]
fn racing_name_creation_converges_on_one_queue() {
    let r = region();
    let _keep = r.attach();

    let qids: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let shf = Shf::attach_existing(&r.cfg).unwrap();
                    shf.queue_new_name("contested").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(qids.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn writes_are_visible_across_handles() {
    let r = region();
    let _keep = r.attach();

    thread::scope(|s| {
        let writer = s.spawn(|| {
            let shf = Shf::attach_existing(&r.cfg).unwrap();
            for i in 0..100u32 {
                shf.put_key_val(format!("k{}", i).as_bytes(), &i.to_le_bytes())
                    .unwrap();
            }
        });
        let reader = s.spawn(|| {
            let shf = Shf::attach_existing(&r.cfg).unwrap();
            // Poll for the last key; once it is there, every key must be.
            while shf.get_key_val(b"k99").unwrap().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            for i in 0..100u32 {
                let got = shf.get_key_val(format!("k{}", i).as_bytes()).unwrap();
                assert_eq!(got.as_deref(), Some(&i.to_le_bytes()[..]));
            }
        });
        writer.join().unwrap();
        reader.join().unwrap();
    });
}

#[test]
fn single_producer_single_consumer_is_fifo() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("pipe").unwrap();
    let n = 200u32;

    thread::scope(|s| {
        s.spawn(|| {
            let shf = Shf::attach_existing(&r.cfg).unwrap();
            for tag in 0..n {
                let item = shf.queue_new_item(8).unwrap();
                shf.queue_push_head_with(q, item, &tag.to_le_bytes()).unwrap();
            }
        });

        let mut seen = Vec::with_capacity(n as usize);
        while seen.len() < n as usize {
            match shf.queue_pull_tail_copy(q).unwrap() {
                Some((_, bytes)) => {
                    seen.push(u32::from_le_bytes(bytes.as_slice().try_into().unwrap()))
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
    });
}

#[test]
fn racing_combined_hand_off_conserves_every_item() {
    let r = region();
    let shf = r.attach();
    let a = shf.queue_new_name("a").unwrap();
    let b = shf.queue_new_name("b").unwrap();
    let n = 256u32;

    for tag in 0..n {
        let item = shf.queue_new_item(8).unwrap();
        shf.queue_push_head_with(a, item, &tag.to_le_bytes()).unwrap();
    }

    // Four movers race the combined primitive over the same pair of
    // queues. Every item must land in b exactly once.
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let shf = Shf::attach_existing(&r.cfg).unwrap();
                let mut carry: Option<Uid> = None;
                loop {
                    carry = shf.queue_push_head_pull_tail(carry, b, a).unwrap();
                    if carry.is_none() {
                        break;
                    }
                }
            });
        }
    });

    let mut tags = HashSet::new();
    while let Some((_, bytes)) = shf.queue_pull_tail_copy(b).unwrap() {
        let tag = u32::from_le_bytes(bytes.as_slice().try_into().unwrap());
        assert!(tags.insert(tag), "tag {} pulled twice", tag);
    }
    assert_eq!(tags.len(), n as usize);
    assert_eq!(shf.queue_pull_tail(a).unwrap(), None);
}

#[test]
fn race_barrier_releases_all_horses_together() {
    let r = region();
    let shf = r.attach();
    shf.race_init("start", 4).unwrap();

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let shf = Shf::attach_existing(&r.cfg).unwrap();
                    shf.race_start("start").unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    });
}
