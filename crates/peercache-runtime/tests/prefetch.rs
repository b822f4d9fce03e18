//! Prefetch windows: warm what is missing, skip what is cached, survive
//! per-sample failures, stop early on cancel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use peercache_core::types::{NodeId, PrefetchWindow, SampleName};
use peercache_runtime::cache::{NodeCache, NodeCacheConfig};
use peercache_runtime::disk::DiskSource;
use peercache_segment::{SegmentStore, SegmentStoreConfig};

fn temp_store(test_name: &str) -> Result<SegmentStore> {
    let mut root: PathBuf = std::env::temp_dir();
    root.push(format!(
        "peercache-prefetch-{test_name}-{}-{}",
        std::process::id(),
        peercache_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(SegmentStore::new(SegmentStoreConfig { root }))
}

fn name(s: &str) -> SampleName {
    SampleName::new(s).unwrap()
}

#[derive(Default)]
struct MapDisk {
    samples: HashMap<SampleName, Vec<u8>>,
    reads: AtomicU64,
    delay: Duration,
}

impl DiskSource for MapDisk {
    fn read_sample(&self, name: &SampleName) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.samples.get(name).cloned())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_warms_missing_skips_cached_counts_failures() -> Result<()> {
    let store = temp_store("mixed-window")?;

    // s1 is outside the window, s4 is already cached, s5 exists nowhere.
    let names: Vec<SampleName> = (1..=6).map(|i| name(&format!("s{i}"))).collect();
    let mut disk = MapDisk::default();
    for n in [&names[1], &names[2], &names[5]] {
        disk.samples.insert((*n).clone(), b"warm me".to_vec());
    }

    let cache = NodeCache::new(
        NodeCacheConfig::new(NodeId("a".to_string())),
        store.clone(),
        Arc::new(disk),
    );
    let mut cached = store.create_exclusive(&names[3])?;
    cached.put(b"already here".to_vec())?;
    cached.close();

    let window = PrefetchWindow { start: 1, end: 5 };
    let report = cache.schedule_prefetch(names.clone(), window).join().await?;

    assert_eq!(report.attempted, 4);
    assert_eq!(report.warmed, 2, "s2 and s3 come off disk");
    assert_eq!(report.skipped, 1, "s4 was cached before the window ran");
    assert_eq!(report.failed, 1, "s5 exists nowhere");

    assert!(cache.is_cached(&names[1]));
    assert!(cache.is_cached(&names[2]));
    assert!(!cache.is_cached(&names[0]), "outside the window");
    assert!(!cache.is_cached(&names[5]), "outside the window");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_is_clamped_to_the_name_list() -> Result<()> {
    let store = temp_store("clamped")?;
    let names = vec![name("only_one")];
    let mut disk = MapDisk::default();
    disk.samples.insert(names[0].clone(), b"x".to_vec());

    let cache = NodeCache::new(
        NodeCacheConfig::new(NodeId("a".to_string())),
        store,
        Arc::new(disk),
    );

    let window = PrefetchWindow { start: 0, end: 100 };
    let report = cache.schedule_prefetch(names, window).join().await?;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.warmed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_scheduling_further_names() -> Result<()> {
    let store = temp_store("cancel")?;
    let names: Vec<SampleName> = (0..20).map(|i| name(&format!("slow_{i}"))).collect();
    let mut disk = MapDisk {
        delay: Duration::from_millis(100),
        ..MapDisk::default()
    };
    for n in &names {
        disk.samples.insert(n.clone(), b"slow".to_vec());
    }

    let mut config = NodeCacheConfig::new(NodeId("a".to_string()));
    config.prefetch_concurrency = 1;
    let cache = NodeCache::new(config, store, Arc::new(disk));

    let handle = cache.schedule_prefetch(names, PrefetchWindow { start: 0, end: 20 });
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    let report = handle.join().await?;

    assert!(report.attempted < 20, "cancel must cut the window short");
    assert_eq!(
        report.warmed + report.skipped + report.failed,
        report.attempted,
        "spawned warm-ups still settle into the report"
    );
    Ok(())
}
