use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use peercache_core::types::SampleName;
use peercache_proto::{encode_get, ProtoError, ResponseHeader, HEADER_SIZE};

use crate::SocketTuning;

/// Definitive results of one fetch exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Vec<u8>),
    /// The peer does not cache the sample. Not retryable against the same
    /// node; the index hint was stale.
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Peer closed the stream before a complete header or body arrived.
    /// Retry on a fresh connection is appropriate.
    #[error("connection to {0} closed before a complete response")]
    ConnectionClosed(SocketAddr),
    #[error("transport error talking to {addr}: {source}")]
    Transport {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// An earlier exchange on this connection failed mid-frame; the byte
    /// stream may be desynchronized and the connection must be discarded.
    #[error("connection to {0} is poisoned by an earlier framing failure")]
    Poisoned(SocketAddr),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

/// Client side of the fetch protocol over one long-lived, tuned connection.
///
/// One connection serves many sequential requests. Any transport-level
/// failure poisons the connection: subsequent calls fail fast with
/// [`FetchError::Poisoned`] and the owner is expected to drop the client and
/// connect anew.
#[derive(Debug)]
pub struct FetchClient {
    stream: TcpStream,
    peer: SocketAddr,
    poisoned: bool,
}

impl FetchClient {
    /// Opens and tunes a connection to a node's cache-serving endpoint.
    /// Buffer sizing happens on the unconnected socket; `TCP_NODELAY` is set
    /// on the established stream. One-time setup, not per-request.
    pub async fn connect(peer: SocketAddr, tuning: &SocketTuning) -> std::io::Result<Self> {
        let socket = match peer {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(bytes) = tuning.recv_buffer_bytes {
            socket.set_recv_buffer_size(bytes)?;
        }
        if let Some(bytes) = tuning.send_buffer_bytes {
            socket.set_send_buffer_size(bytes)?;
        }
        let stream = socket.connect(peer).await?;
        stream.set_nodelay(tuning.nodelay)?;
        Ok(Self {
            stream,
            peer,
            poisoned: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Performs one GET exchange: send the request frame, read the fixed
    /// header, then the body if the header announced one. Partial reads are
    /// reassembled; a short stream is classified as `ConnectionClosed`.
    pub async fn fetch(&mut self, name: &SampleName) -> Result<FetchOutcome, FetchError> {
        if self.poisoned {
            return Err(FetchError::Poisoned(self.peer));
        }
        match self.exchange(name).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    async fn exchange(&mut self, name: &SampleName) -> Result<FetchOutcome, FetchError> {
        let frame = encode_get(name)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|err| self.classify(err))?;

        let mut header = [0u8; HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| self.classify(err))?;

        match ResponseHeader::decode(header) {
            ResponseHeader::NotFound => Ok(FetchOutcome::NotFound),
            ResponseHeader::Found(len) => {
                let len = usize::try_from(len).map_err(|_| FetchError::Transport {
                    addr: self.peer,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "announced payload length exceeds addressable memory",
                    ),
                })?;
                let mut body = vec![0u8; len];
                self.stream
                    .read_exact(&mut body)
                    .await
                    .map_err(|err| self.classify(err))?;
                Ok(FetchOutcome::Found(body))
            }
        }
    }

    fn classify(&self, err: std::io::Error) -> FetchError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FetchError::ConnectionClosed(self.peer)
        } else {
            FetchError::Transport {
                addr: self.peer,
                source: err,
            }
        }
    }
}
