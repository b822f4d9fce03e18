#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod server;

/// Socket-level tunables applied once per connection, before any request.
///
/// Bulk sample transfer wants large kernel buffers, and single
/// request/response round trips must not sit behind the transport's
/// small-packet coalescing delay, so Nagle is disabled by default.
#[derive(Debug, Clone, Copy)]
pub struct SocketTuning {
    pub recv_buffer_bytes: Option<u32>,
    pub send_buffer_bytes: Option<u32>,
    pub nodelay: bool,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: None,
            send_buffer_bytes: None,
            nodelay: true,
        }
    }
}
