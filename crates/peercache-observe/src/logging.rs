use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `PEERCACHE_LOG` first, then
/// `RUST_LOG`, then a default of `info`.
///
/// Log field contract for peercache daemons:
/// - Always include `node_id` when available.
/// - Include `sample` on any per-sample cache event.
/// - Include `peer` on any remote-fetch event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PEERCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
