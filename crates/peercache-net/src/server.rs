use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use peercache_core::types::SampleName;
use peercache_observe::metrics::Counter;
use peercache_proto::{decode_get, ResponseHeader, REQUEST_SIZE};
use peercache_segment::SegmentStore;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub requests_total: Counter,
    pub hits_total: Counter,
    pub misses_total: Counter,
    pub bad_frames_total: Counter,
}

/// The node's cache-serving endpoint.
///
/// Accepts connections and answers GET frames out of the local
/// [`SegmentStore`]. A segment that is absent or not yet populated is a miss;
/// the index hint that led the peer here was stale and the sentinel header
/// tells it so.
pub struct CacheServer;

pub struct ServerHandle {
    addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Stops accepting and waits for the accept loop to exit. Connections
    /// already being served finish their current request loop on their own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl CacheServer {
    pub async fn bind(addr: SocketAddr, store: SegmentStore) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        Self::spawn(listener, store)
    }

    pub fn spawn(listener: TcpListener, store: SegmentStore) -> std::io::Result<ServerHandle> {
        let addr = listener.local_addr()?;
        let metrics = Arc::new(ServerMetrics::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let loop_metrics = metrics.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    res = listener.accept() => {
                        let Ok((sock, peer)) = res else { break; };
                        let store = store.clone();
                        let metrics = loop_metrics.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(sock, store, metrics).await {
                                tracing::debug!(%peer, error = %err, "cache connection ended");
                            }
                        });
                    }
                }
            }
        });

        tracing::info!(%addr, "cache server listening");
        Ok(ServerHandle {
            addr,
            metrics,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

async fn serve_connection(
    mut sock: TcpStream,
    store: SegmentStore,
    metrics: Arc<ServerMetrics>,
) -> std::io::Result<()> {
    loop {
        let mut frame = [0u8; REQUEST_SIZE];
        // A clean EOF between frames ends the connection; an EOF inside a
        // frame is a truncated request.
        let first = sock.read(&mut frame).await?;
        if first == 0 {
            return Ok(());
        }
        let mut filled = first;
        while filled < REQUEST_SIZE {
            let n = sock.read(&mut frame[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-request",
                ));
            }
            filled += n;
        }

        metrics.requests_total.inc();
        let name = match decode_get(&frame) {
            Ok(name) => name,
            Err(err) => {
                // Framing is already suspect; tear the connection down
                // rather than guess at resynchronization.
                metrics.bad_frames_total.inc();
                tracing::warn!(error = %err, "malformed request frame");
                return Ok(());
            }
        };

        match read_segment(&store, &name).await? {
            Some(bytes) => {
                metrics.hits_total.inc();
                tracing::debug!(sample = %name, size = bytes.len(), "serving cached sample");
                let header = ResponseHeader::Found(bytes.len() as u64)
                    .encode()
                    .map_err(|err| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
                    })?;
                sock.write_all(&header).await?;
                sock.write_all(&bytes).await?;
            }
            None => {
                metrics.misses_total.inc();
                tracing::debug!(sample = %name, "sample not in cache");
                sock.write_all(peercache_proto::NOT_FOUND_SENTINEL).await?;
            }
        }
    }
}

/// Reads a populated segment off the blocking pool, `None` on any miss.
/// Attach-then-read races (a concurrent `remove`) degrade to a miss.
async fn read_segment(store: &SegmentStore, name: &SampleName) -> std::io::Result<Option<Vec<u8>>> {
    let store = store.clone();
    let name = name.clone();
    let bytes = tokio::task::spawn_blocking(move || {
        if store.lookup(&name).is_none() {
            return None;
        }
        let mut entry = store.attach(&name).ok()?;
        let bytes = entry.read().ok()?;
        entry.close();
        if bytes.is_empty() {
            None
        } else {
            Some(bytes)
        }
    })
    .await
    .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(bytes)
}
