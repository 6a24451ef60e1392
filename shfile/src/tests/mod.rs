mod concurrency_tests;
mod queue_tests;

use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::{Shf, ShfConfig, ShfConfigBuilder};

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Scratch region: unique name per test, backing dir removed on drop.
pub(crate) struct TestRegion {
    pub cfg: ShfConfig,
    _dir: TempDir,
}

impl TestRegion {
    pub fn attach(&self) -> Shf {
        Shf::attach(&self.cfg).unwrap()
    }
}

pub(crate) fn region() -> TestRegion {
    region_with(|b| b)
}

pub(crate) fn region_with(f: impl FnOnce(ShfConfigBuilder) -> ShfConfigBuilder) -> TestRegion {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let name = format!(
        "t{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let builder = ShfConfig::builder()
        .data_dir(dir.path().to_str().unwrap())
        .name(name)
        .data_capacity(1 << 20)
        .block_size(4096)
        .buckets(256)
        .stripes(8)
        .max_slots(4096)
        .max_queues(16);
    TestRegion {
        cfg: f(builder).build().unwrap(),
        _dir: dir,
    }
}
