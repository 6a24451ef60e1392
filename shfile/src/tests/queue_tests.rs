use crate::tests::region;
use crate::{Qid, ShfError, Uid};

#[test]
fn push_pull_is_fifo() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("work").unwrap();

    for tag in [b"a", b"b", b"c"] {
        let item = shf.queue_new_item(16).unwrap();
        shf.queue_push_head_with(q, item, tag).unwrap();
    }
    for expect in [b"a", b"b", b"c"] {
        let (_, bytes) = shf.queue_pull_tail_copy(q).unwrap().unwrap();
        assert_eq!(bytes, expect);
    }
    assert_eq!(shf.queue_pull_tail(q).unwrap(), None);
}

#[test]
fn pulled_item_can_be_reused() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("loop").unwrap();

    let item = shf.queue_new_item(8).unwrap();
    shf.queue_push_head_with(q, item, b"one").unwrap();
    let got = shf.queue_pull_tail(q).unwrap().unwrap();
    assert_eq!(got, item);

    // The caller owns a pulled item and may rewrite and requeue it.
    shf.queue_push_head_with(q, got, b"two").unwrap();
    let (_, bytes) = shf.queue_pull_tail_copy(q).unwrap().unwrap();
    assert_eq!(bytes, b"two");
}

#[test]
fn pushing_a_queued_item_is_rejected() {
    let r = region();
    let shf = r.attach();
    let a = shf.queue_new_name("a").unwrap();
    let b = shf.queue_new_name("b").unwrap();

    let item = shf.queue_new_item(8).unwrap();
    shf.queue_push_head(a, item).unwrap();
    assert!(matches!(
        shf.queue_push_head(b, item),
        Err(ShfError::Usage(_))
    ));
    // Writing a queued item is rejected too.
    assert!(matches!(
        shf.queue_put_item(item, b"x"),
        Err(ShfError::Usage(_))
    ));
}

#[test]
fn lone_queue_member_cannot_be_double_queued() {
    let r = region();
    let shf = r.attach();
    let a = shf.queue_new_name("a").unwrap();
    let b = shf.queue_new_name("b").unwrap();

    // A queue's only member has both links at the sentinel, so membership
    // must come from the owner field, not the links.
    let item = shf.queue_new_item(8).unwrap();
    shf.queue_push_head(a, item).unwrap();
    assert!(matches!(
        shf.queue_push_head(b, item),
        Err(ShfError::Usage(_))
    ));
    assert!(matches!(
        shf.queue_put_item(item, b"x"),
        Err(ShfError::Usage(_))
    ));

    // Pulling releases ownership; the item may then move to another queue.
    assert_eq!(shf.queue_pull_tail(a).unwrap(), Some(item));
    shf.queue_push_head(b, item).unwrap();
    assert_eq!(shf.queue_pull_tail(b).unwrap(), Some(item));
    assert_eq!(shf.queue_pull_tail(a).unwrap(), None);
}

#[test]
fn oversized_payload_is_rejected() {
    let r = region();
    let shf = r.attach();
    let item = shf.queue_new_item(4).unwrap();
    assert!(matches!(
        shf.queue_put_item(item, b"five!"),
        Err(ShfError::Usage(_))
    ));
    shf.queue_put_item(item, b"four").unwrap();
}

#[test]
fn stale_uid_reads_as_absent_item() {
    let r = region();
    let shf = r.attach();
    // A key-value UID is not an item, and an unissued UID is nothing at all.
    let kv = shf.put_key_val(b"k", b"v").unwrap();
    assert_eq!(shf.with_item(kv, |b| b.len()).unwrap(), None);
    assert_eq!(shf.with_item(Uid(40_000), |b| b.len()).unwrap(), None);
}

#[test]
fn combined_push_pull_moves_a_stream_between_queues() {
    let r = region();
    let shf = r.attach();
    let a = shf.queue_new_name("a").unwrap();
    let b = shf.queue_new_name("b").unwrap();

    let n = 10u32;
    for tag in 0..n {
        let item = shf.queue_new_item(8).unwrap();
        shf.queue_push_head_with(a, item, &tag.to_le_bytes()).unwrap();
    }

    // Drain a into b with the combined primitive, then check b preserved
    // the order end to end.
    let mut carry: Option<Uid> = None;
    loop {
        carry = shf.queue_push_head_pull_tail(carry, b, a).unwrap();
        if carry.is_none() {
            break;
        }
    }
    let mut seen = Vec::new();
    while let Some((_, bytes)) = shf.queue_pull_tail_copy(b).unwrap() {
        seen.push(u32::from_le_bytes(bytes.as_slice().try_into().unwrap()));
    }
    assert_eq!(seen, (0..n).collect::<Vec<_>>());
    assert_eq!(shf.queue_pull_tail(a).unwrap(), None);
}

#[test]
fn combined_with_no_push_is_a_pull() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("q").unwrap();
    assert_eq!(shf.queue_push_head_pull_tail(None, q, q).unwrap(), None);

    let item = shf.queue_new_item(8).unwrap();
    shf.queue_push_head(q, item).unwrap();
    assert_eq!(shf.queue_push_head_pull_tail(None, q, q).unwrap(), Some(item));
}

#[test]
fn combined_same_queue_round_trips_through_empty() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("q").unwrap();
    let item = shf.queue_new_item(8).unwrap();
    // Push and pull under one lock hold: the item comes straight back.
    assert_eq!(
        shf.queue_push_head_pull_tail(Some(item), q, q).unwrap(),
        Some(item)
    );
    assert_eq!(shf.queue_pull_tail(q).unwrap(), None);
}

#[test]
fn queue_size_tracks_membership() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("sized").unwrap();
    assert_eq!(shf.queue_size(q).unwrap(), 0);

    let items: Vec<_> = (0..5)
        .map(|_| {
            let item = shf.queue_new_item(8).unwrap();
            shf.queue_push_head(q, item).unwrap();
            item
        })
        .collect();
    assert_eq!(shf.queue_size(q).unwrap(), 5);

    shf.queue_pull_tail(q).unwrap().unwrap();
    assert_eq!(shf.queue_size(q).unwrap(), 4);
    assert!(shf.queue_take_item(q, items[2]).unwrap());
    assert_eq!(shf.queue_size(q).unwrap(), 3);

    // A freshly seeded pool's free queue reports every item.
    let pool = shf.queue_pool_new(2, 8, 16, 1).unwrap();
    assert_eq!(shf.queue_size(pool.qid(0)).unwrap(), 8);
    assert_eq!(shf.queue_size(pool.qid(1)).unwrap(), 0);
}

#[test]
fn take_item_unlinks_from_anywhere_in_the_queue() {
    let r = region();
    let shf = r.attach();
    let q = shf.queue_new_name("q").unwrap();

    let items: Vec<_> = (0..3)
        .map(|tag: u8| {
            let item = shf.queue_new_item(8).unwrap();
            shf.queue_push_head_with(q, item, &[tag]).unwrap();
            item
        })
        .collect();

    // Middle of the queue: neighbors must be relinked around it.
    assert!(shf.queue_take_item(q, items[1]).unwrap());
    // Taking it again, or from a queue it is not in, is a no-op.
    assert!(!shf.queue_take_item(q, items[1]).unwrap());

    // The taken item is owned and reusable; the rest drain in order.
    shf.queue_put_item(items[1], b"again").unwrap();
    let (first, _) = shf.queue_pull_tail_copy(q).unwrap().unwrap();
    let (second, _) = shf.queue_pull_tail_copy(q).unwrap().unwrap();
    assert_eq!(first, items[0]);
    assert_eq!(second, items[2]);
    assert_eq!(shf.queue_pull_tail(q).unwrap(), None);

    // Head and tail positions unlink cleanly too.
    shf.queue_push_head(q, items[0]).unwrap();
    shf.queue_push_head(q, items[2]).unwrap();
    assert!(shf.queue_take_item(q, items[2]).unwrap());
    assert!(shf.queue_take_item(q, items[0]).unwrap());
    assert_eq!(shf.queue_size(q).unwrap(), 0);
    assert_eq!(shf.queue_pull_tail(q).unwrap(), None);
}

#[test]
fn queue_names_are_created_once() {
    let r = region();
    let shf = r.attach();

    assert_eq!(shf.queue_get_name("jobs").unwrap(), None);
    let q1 = shf.queue_new_name("jobs").unwrap();
    let q2 = shf.queue_new_name("jobs").unwrap();
    assert_eq!(q1, q2);
    assert_eq!(shf.queue_get_name("jobs").unwrap(), Some(q1));

    let other = shf.queue_new_name("other").unwrap();
    assert_ne!(q1, other);
}

#[test]
fn pool_seeds_every_item_into_the_free_queue() {
    let r = region();
    let shf = r.attach();
    let pool = shf.queue_pool_new(2, 8, 64, 2).unwrap();

    assert_eq!(pool.queues(), 2);
    assert_eq!(pool.items(), 8);
    assert_eq!(pool.item_size(), 64);

    // The free queue drains oldest-first: item 0, 1, ... with consecutive
    // UIDs.
    let free = pool.qid(0);
    for i in 0..8 {
        assert_eq!(shf.queue_pull_tail(free).unwrap(), Some(pool.item_uid(i)));
    }
    assert_eq!(shf.queue_pull_tail(free).unwrap(), None);
}

#[test]
fn pool_items_are_zero_copy_and_flow_between_pool_queues() {
    let r = region();
    let shf = r.attach();
    let pool = shf.queue_pool_new(2, 4, 32, 1).unwrap();
    let free = pool.qid(0);
    let work = pool.qid(1);

    let item = shf.queue_pull_tail(free).unwrap().unwrap();
    shf.with_item_mut(item, |b| b[..5].copy_from_slice(b"hello"))
        .unwrap()
        .unwrap();
    shf.queue_push_head(work, item).unwrap();

    let got = shf.queue_pull_tail(work).unwrap().unwrap();
    assert_eq!(got, item);
    let head = shf.with_item(got, |b| b[..5].to_vec()).unwrap().unwrap();
    assert_eq!(head, b"hello");
    shf.queue_push_head(free, got).unwrap();
}

#[test]
fn pool_is_visible_from_other_handles() {
    let r = region();
    let shf = r.attach();
    assert!(shf.queue_pool_get().unwrap().is_none());
    let pool = shf.queue_pool_new(3, 16, 128, 1).unwrap();

    let other = r.attach();
    let view = other.queue_pool_get().unwrap().unwrap();
    assert_eq!(view.qid(0), pool.qid(0));
    assert_eq!(view.item_uid(15), pool.item_uid(15));
    assert_eq!(view.item_size(), 128);

    // Second creation is refused.
    assert!(matches!(
        shf.queue_pool_new(1, 1, 8, 1),
        Err(ShfError::Usage(_))
    ));
}

#[test]
fn pool_and_named_queues_share_the_queue_table() {
    let r = region();
    let shf = r.attach();
    let named = shf.queue_new_name("before").unwrap();
    let pool = shf.queue_pool_new(2, 2, 16, 1).unwrap();
    let after = shf.queue_new_name("after").unwrap();

    let mut qids = vec![named, pool.qid(0), pool.qid(1), after];
    qids.sort_by_key(|q| q.0);
    qids.dedup();
    assert_eq!(qids.len(), 4, "qids must not collide");
}

#[test]
fn out_of_range_qid_is_rejected() {
    let r = region();
    let shf = r.attach();
    let item = shf.queue_new_item(8).unwrap();
    assert!(shf.queue_push_head(Qid(9999), item).is_err());
}
