use std::error::Error;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shfile::{Shf, ShfConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shfile-kv.toml")]
    config: String,
    /// Number of put/get pairs to run.
    #[clap(short = 'n', long = "ops", default_value_t = 1_000_000)]
    ops: usize,
    /// Value size in bytes.
    #[clap(short = 's', long = "value-size", default_value_t = 64)]
    value_size: usize,
    /// Distinct keys to cycle over.
    #[clap(short = 'k', long = "keys", default_value_t = 10_000)]
    keys: usize,
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

fn run(shf: &Shf, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let value = vec![0x5au8; opts.value_size];
    let keys: Vec<Vec<u8>> = (0..opts.keys)
        .map(|i| format!("bench-key-{}", i).into_bytes())
        .collect();

    let start = Instant::now();
    for op in 0..opts.ops {
        let key = &keys[op % keys.len()];
        shf.put_or_replace(key, &value)?;
        let got = shf.get_key_val(key)?;
        debug_assert_eq!(got.as_deref(), Some(value.as_slice()));
        if op % 500_000 == 0 {
            eprint!("\rTotal {} ops", op);
        }
    }
    let duration = start.elapsed();
    let iops = ((opts.ops * 2) as f64 / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K key/value ops/s. Total time: {:#?}, garbage: {} bytes",
        (iops / 1000f64) as u64,
        duration,
        shf.debug_get_garbage()
    );
    Ok(())
}
