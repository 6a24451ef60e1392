use std::error::Error;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shfile::{Shf, ShfConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shfile-queue.toml")]
    config: String,
    /// Items to move through the pool queues.
    #[clap(short = 'n', long = "ops", default_value_t = 1_000_000)]
    ops: usize,
    /// Pool item payload size in bytes.
    #[clap(short = 's', long = "item-size", default_value_t = 64)]
    item_size: u32,
    /// Pool item count.
    #[clap(short = 'i', long = "items", default_value_t = 1024)]
    items: u32,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let cfg: ShfConfig = confy::load_path(&opts.config)?;
    let shf = Shf::attach(&cfg)?;
    run(&shf, &opts)?;
    Ok(())
}

/// Cycle items free -> work -> free with the combined primitive, the hot
/// path of a multi-process pipeline collapsed into one process.
fn run(shf: &Shf, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let pool = match shf.queue_pool_get()? {
        Some(pool) => pool,
        None => shf.queue_pool_new(2, opts.items, opts.item_size, 2)?,
    };
    let free = pool.qid(0);
    let work = pool.qid(1);

    let start = Instant::now();
    let mut moved = 0usize;
    let mut carry = None;
    while moved < opts.ops {
        carry = shf.queue_push_head_pull_tail(carry, work, free)?;
        if carry.is_none() {
            // work holds everything; drain it back to free.
            while let Some(item) = shf.queue_pull_tail(work)? {
                shf.queue_push_head(free, item)?;
            }
            continue;
        }
        moved += 1;
        if moved % 500_000 == 0 {
            eprint!("\rTotal {} hand-offs", moved);
        }
    }
    let duration = start.elapsed();
    let iops = (moved as f64 / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K hand-offs/s over {} items of {} bytes. Total time: {:#?}",
        (iops / 1000f64) as u64,
        pool.items(),
        pool.item_size(),
        duration
    );
    Ok(())
}
