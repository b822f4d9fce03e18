#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, info_span, Instrument};

use peercache_net::server::CacheServer;
use peercache_segment::{SegmentStore, SegmentStoreConfig, DEFAULT_SEGMENT_ROOT};

#[derive(Debug, Parser)]
#[command(name = "peercached")]
struct Args {
    /// Address the cache-serving endpoint listens on.
    #[arg(long, env = "PEERCACHE_BIND_ADDR", default_value = "0.0.0.0:5555")]
    bind_addr: SocketAddr,

    /// Root of the shared-memory segment store, normally a tmpfs.
    #[arg(long, env = "PEERCACHE_CACHE_ROOT", default_value = DEFAULT_SEGMENT_ROOT)]
    cache_root: PathBuf,

    #[arg(long, env = "PEERCACHE_NODE_ID", default_value = "local-node")]
    node_id: String,

    /// Seconds between serving-metrics log lines. 0 disables them.
    #[arg(long, env = "PEERCACHE_METRICS_INTERVAL_SECS", default_value_t = 60)]
    metrics_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    peercache_observe::logging::init_tracing();

    let args = Args::parse();
    let span = info_span!(
        "peercached",
        node_id = %args.node_id,
        bind_addr = %args.bind_addr,
        cache_root = %args.cache_root.display()
    );

    async move {
        let store = SegmentStore::new(SegmentStoreConfig {
            root: args.cache_root.clone(),
        });
        let cached = store.advertised_names()?.len();
        info!(cached, "starting cache daemon");

        let server = CacheServer::bind(args.bind_addr, store).await?;
        let metrics = server.metrics();

        let reporter = if args.metrics_interval_secs > 0 {
            let metrics = metrics.clone();
            let interval = Duration::from_secs(args.metrics_interval_secs);
            Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    info!(
                        requests = metrics.requests_total.get(),
                        hits = metrics.hits_total.get(),
                        misses = metrics.misses_total.get(),
                        bad_frames = metrics.bad_frames_total.get(),
                        "serving metrics"
                    );
                }
            }))
        } else {
            None
        };

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        server.shutdown().await;
        info!(
            requests = metrics.requests_total.get(),
            hits = metrics.hits_total.get(),
            misses = metrics.misses_total.get(),
            "cache daemon stopped"
        );
        Ok(())
    }
    .instrument(span)
    .await
}
