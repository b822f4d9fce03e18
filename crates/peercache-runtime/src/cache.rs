//! Node-local cache front end: on-demand gets with peer fetch and disk
//! fall-through, plus background prefetch of an upcoming sample window.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;

use peercache_core::index::LocationIndex;
use peercache_core::types::{NodeId, PrefetchWindow, SampleName};
use peercache_net::client::{FetchClient, FetchError, FetchOutcome};
use peercache_net::SocketTuning;
use peercache_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};
use peercache_segment::{SegmentError, SegmentStore};

use crate::disk::DiskSource;
use crate::inflight::{Flight, InflightRegistry};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sample {0} is not cached anywhere and not on disk")]
    Unavailable(SampleName),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("disk source failed: {0}")]
    Disk(#[source] anyhow::Error),
    /// A concurrent request for the same sample resolved the flight and it
    /// failed; every waiter observes the same failure.
    #[error("{0}")]
    Shared(Arc<CacheError>),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no known address for node {0}")]
    UnknownPeer(NodeId),
    #[error("connect to {node} at {addr} failed: {source}")]
    Connect {
        node: NodeId,
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Long-lived fetch connections, one idle connection kept per peer.
///
/// A connection is returned to the pool only after a clean exchange; any
/// failed exchange poisons it and the next fetch to that peer reconnects.
#[derive(Debug)]
pub struct PeerPool {
    tuning: SocketTuning,
    peers: RwLock<BTreeMap<NodeId, SocketAddr>>,
    idle: AsyncMutex<HashMap<NodeId, FetchClient>>,
}

impl PeerPool {
    pub fn new(tuning: SocketTuning) -> Self {
        Self {
            tuning,
            peers: RwLock::new(BTreeMap::new()),
            idle: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn set_peer(&self, node: NodeId, addr: SocketAddr) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.insert(node, addr);
    }

    pub fn remove_peer(&self, node: &NodeId) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.remove(node);
    }

    /// One GET exchange with `node`, reusing its idle connection when the
    /// peer address still matches and the connection is healthy.
    pub async fn fetch_from(
        &self,
        node: &NodeId,
        name: &SampleName,
    ) -> Result<FetchOutcome, PoolError> {
        let addr = {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            peers
                .get(node)
                .copied()
                .ok_or_else(|| PoolError::UnknownPeer(node.clone()))?
        };

        let pooled = self.idle.lock().await.remove(node);
        let mut client = match pooled {
            Some(client) if client.peer() == addr && !client.is_poisoned() => client,
            _ => FetchClient::connect(addr, &self.tuning)
                .await
                .map_err(|source| PoolError::Connect {
                    node: node.clone(),
                    addr,
                    source,
                })?,
        };

        match client.fetch(name).await {
            Ok(outcome) => {
                self.idle.lock().await.insert(node.clone(), client);
                Ok(outcome)
            }
            // client is poisoned; drop it instead of pooling it
            Err(err) => Err(PoolError::Fetch(err)),
        }
    }
}

#[derive(Debug, Default)]
pub struct NodeCacheMetrics {
    pub local_hits: Counter,
    pub flight_joins: Counter,
    pub remote_hits: Counter,
    pub stale_hints: Counter,
    pub fetch_errors: Counter,
    pub disk_reads: Counter,
    /// Flights currently resolving a miss (leader count), and the deepest
    /// that count has been.
    pub inflight_fetches: Gauge,
    pub inflight_fetches_peak: Gauge,
    pub remote_fetch: DurationAgg,
    pub disk_read: DurationAgg,
}

#[derive(Debug, Clone)]
pub struct NodeCacheConfig {
    pub node_id: NodeId,
    pub tuning: SocketTuning,
    /// Upper bound on concurrent warm-up fetches across prefetch windows.
    pub prefetch_concurrency: usize,
}

impl NodeCacheConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            tuning: SocketTuning::default(),
            prefetch_concurrency: 8,
        }
    }
}

type FlightResult = Result<Arc<[u8]>, Arc<CacheError>>;

/// The consumer-facing cache for one node.
///
/// `get` resolves a sample through, in order: the local segment store, a
/// peer the location index says caches it, and finally the disk source.
/// Whatever was fetched is published into the local store so the next
/// request (from any local process) is a local hit, and so this node starts
/// advertising the sample on the next index refresh.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    node_id: NodeId,
    store: SegmentStore,
    index: RwLock<LocationIndex>,
    pool: PeerPool,
    inflight: InflightRegistry<FlightResult>,
    disk: Arc<dyn DiskSource>,
    metrics: NodeCacheMetrics,
    prefetch_permits: Arc<Semaphore>,
}

impl NodeCache {
    pub fn new(config: NodeCacheConfig, store: SegmentStore, disk: Arc<dyn DiskSource>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                node_id: config.node_id,
                pool: PeerPool::new(config.tuning),
                store,
                index: RwLock::new(LocationIndex::new()),
                inflight: InflightRegistry::new(),
                disk,
                metrics: NodeCacheMetrics::default(),
                prefetch_permits: Arc::new(Semaphore::new(config.prefetch_concurrency.max(1))),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn store(&self) -> &SegmentStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &NodeCacheMetrics {
        &self.inner.metrics
    }

    /// Swaps in a freshly collected cluster index. Gets in flight keep the
    /// hint they already resolved; new gets see the new index.
    pub fn install_index(&self, index: LocationIndex) {
        let nodes = index.node_count();
        *self
            .inner
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner) = index;
        tracing::debug!(nodes, "location index installed");
    }

    pub fn set_peer(&self, node: NodeId, addr: SocketAddr) {
        self.inner.pool.set_peer(node, addr);
    }

    pub fn remove_peer(&self, node: &NodeId) {
        self.inner.pool.remove_peer(node);
    }

    /// Local-presence check. One metadata call; fine on the runtime thread.
    pub fn is_cached(&self, name: &SampleName) -> bool {
        self.inner.store.lookup(name).is_some()
    }

    /// Resolves `name` to its bytes, warming the local store on the way.
    ///
    /// Concurrent gets for the same name collapse into one resolution; the
    /// shared bytes come back as `Arc<[u8]>` so followers pay no copy.
    pub async fn get(&self, name: &SampleName) -> Result<Arc<[u8]>, CacheError> {
        if let Some(bytes) = self.read_local(name).await? {
            self.inner.metrics.local_hits.inc();
            return Ok(bytes);
        }

        loop {
            match self.inner.inflight.begin(name) {
                Flight::Leader(leader) => {
                    let depth = self.inner.metrics.inflight_fetches.add(1);
                    self.inner.metrics.inflight_fetches_peak.max(depth);
                    let resolved = self.resolve_miss(name).await;
                    self.inner.metrics.inflight_fetches.sub(1);
                    return match resolved {
                        Ok(bytes) => {
                            leader.finish(Ok(bytes.clone()));
                            Ok(bytes)
                        }
                        Err(err) => {
                            let err = Arc::new(err);
                            leader.finish(Err(err.clone()));
                            // With no followers the flight is fully retired
                            // here and the error unwraps back to its owner.
                            Err(match Arc::try_unwrap(err) {
                                Ok(err) => err,
                                Err(shared) => CacheError::Shared(shared),
                            })
                        }
                    };
                }
                Flight::Follower(rx) => {
                    self.inner.metrics.flight_joins.inc();
                    match InflightRegistry::wait(rx).await {
                        Some(Ok(bytes)) => return Ok(bytes),
                        Some(Err(err)) => return Err(CacheError::Shared(err)),
                        // leader aborted without publishing; race again
                        None => continue,
                    }
                }
            }
        }
    }

    /// Schedules background warming of `window` out of `names`.
    ///
    /// Samples already cached locally are skipped; everything else goes
    /// through the normal `get` path (and therefore de-duplicates against
    /// concurrent on-demand gets). Individual failures are counted, never
    /// fatal to the window.
    pub fn schedule_prefetch(
        &self,
        names: Vec<SampleName>,
        window: PrefetchWindow,
    ) -> PrefetchHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let window = window.clamp_to(names.len());
            tracing::debug!(
                start = window.start,
                end = window.end,
                "prefetch window scheduled"
            );

            let mut report = PrefetchReport::default();
            let mut warmers = JoinSet::new();
            for name in &names[window.start..window.end] {
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(permit) = cache.inner.prefetch_permits.clone().acquire_owned().await
                else {
                    break;
                };
                report.attempted += 1;

                let cache = cache.clone();
                let name = name.clone();
                warmers.spawn(async move {
                    let _permit = permit;
                    if cache.is_cached(&name) {
                        return WarmOutcome::Skipped;
                    }
                    match cache.get(&name).await {
                        Ok(_) => WarmOutcome::Warmed,
                        Err(err) => {
                            tracing::debug!(sample = %name, error = %err, "prefetch failed");
                            WarmOutcome::Failed
                        }
                    }
                });
            }

            while let Some(joined) = warmers.join_next().await {
                match joined {
                    Ok(WarmOutcome::Warmed) => report.warmed += 1,
                    Ok(WarmOutcome::Skipped) => report.skipped += 1,
                    Ok(WarmOutcome::Failed) | Err(_) => report.failed += 1,
                }
            }
            tracing::info!(
                attempted = report.attempted,
                warmed = report.warmed,
                skipped = report.skipped,
                failed = report.failed,
                "prefetch window done"
            );
            report
        });
        PrefetchHandle { cancel, task }
    }

    async fn read_local(&self, name: &SampleName) -> Result<Option<Arc<[u8]>>, CacheError> {
        let store = self.inner.store.clone();
        let name = name.clone();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, SegmentError> {
            if store.lookup(&name).is_none() {
                return Ok(None);
            }
            // attach races a concurrent remove; treat it as a miss
            let mut entry = match store.attach(&name) {
                Ok(entry) => entry,
                Err(SegmentError::NotFound(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            let bytes = entry.read()?;
            entry.close();
            Ok(if bytes.is_empty() { None } else { Some(bytes) })
        })
        .await??;
        Ok(bytes.map(Arc::from))
    }

    async fn resolve_miss(&self, name: &SampleName) -> Result<Arc<[u8]>, CacheError> {
        // Another local process may have populated the segment while this
        // caller raced for flight leadership.
        if let Some(bytes) = self.read_local(name).await? {
            self.inner.metrics.local_hits.inc();
            return Ok(bytes);
        }

        let holder = {
            let index = self.inner.index.read().unwrap_or_else(PoisonError::into_inner);
            index.lookup(name, &self.inner.node_id).cloned()
        };

        if let Some(node) = holder {
            let outcome = {
                let _timer = ScopedTimer::new(&self.inner.metrics.remote_fetch);
                self.inner.pool.fetch_from(&node, name).await
            };
            match outcome {
                Ok(FetchOutcome::Found(bytes)) => {
                    self.inner.metrics.remote_hits.inc();
                    let bytes: Arc<[u8]> = Arc::from(bytes);
                    self.store_put(name, &bytes).await?;
                    return Ok(bytes);
                }
                Ok(FetchOutcome::NotFound) => {
                    // Definitive answer from the peer: the hint was stale.
                    self.inner.metrics.stale_hints.inc();
                    tracing::debug!(sample = %name, node = %node, "stale index hint");
                }
                Err(err) => {
                    self.inner.metrics.fetch_errors.inc();
                    tracing::warn!(
                        sample = %name,
                        node = %node,
                        error = %err,
                        "remote fetch failed, falling back to disk"
                    );
                }
            }
        }

        self.inner.metrics.disk_reads.inc();
        let disk = self.inner.disk.clone();
        let disk_name = name.clone();
        let read = {
            let _timer = ScopedTimer::new(&self.inner.metrics.disk_read);
            tokio::task::spawn_blocking(move || disk.read_sample(&disk_name)).await?
        };

        let bytes = read
            .map_err(CacheError::Disk)?
            .ok_or_else(|| CacheError::Unavailable(name.clone()))?;
        let bytes: Arc<[u8]> = Arc::from(bytes);
        self.store_put(name, &bytes).await?;
        Ok(bytes)
    }

    /// Publishes resolved bytes into the local store. Losing an exclusive
    /// create race is fine: samples are immutable, so whatever writer won
    /// stored the same content.
    async fn store_put(&self, name: &SampleName, bytes: &Arc<[u8]>) -> Result<(), CacheError> {
        let store = self.inner.store.clone();
        let name = name.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), SegmentError> {
            let mut entry = store.create_or_get(&name)?;
            if entry.size() == 0 {
                entry.put(bytes)?;
            }
            entry.close();
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Names the window actually examined before cancellation.
    pub attempted: u64,
    pub warmed: u64,
    /// Already cached locally when the window reached them.
    pub skipped: u64,
    pub failed: u64,
}

enum WarmOutcome {
    Warmed,
    Skipped,
    Failed,
}

/// Owner's handle to a scheduled prefetch window.
pub struct PrefetchHandle {
    cancel: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<PrefetchReport>,
}

impl PrefetchHandle {
    /// Stops scheduling further names. Warm-ups already spawned run to
    /// completion and are reflected in the report.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn join(self) -> Result<PrefetchReport, tokio::task::JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_from_unknown_peer_is_an_error() {
        let pool = PeerPool::new(SocketTuning::default());
        let name = SampleName::new("s1").unwrap();
        let err = pool
            .fetch_from(&NodeId("ghost".to_string()), &name)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownPeer(_)));
    }

    #[test]
    fn prefetch_report_defaults_to_zero() {
        let report = PrefetchReport::default();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.warmed + report.skipped + report.failed, 0);
    }
}
