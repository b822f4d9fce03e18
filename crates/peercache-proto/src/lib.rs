#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Fixed-frame codec for the cache fetch protocol.
//!
//! One request/response exchange over a persistent byte stream:
//!
//! - request: a [`REQUEST_SIZE`]-byte frame, `GET ` tag followed by the
//!   sample name NUL-padded to [`MAX_NAME_LEN`] bytes;
//! - response: a [`HEADER_SIZE`]-byte header that is either the literal
//!   `NOTFOUND` sentinel or the payload length as a little-endian u64,
//!   followed (found case only) by exactly that many payload bytes.

use thiserror::Error;

use peercache_core::types::{NameError, SampleName, MAX_NAME_LEN};

/// Total width of one request frame.
pub const REQUEST_SIZE: usize = 100;

/// Command tag opening every request frame.
pub const TAG_GET: &[u8; 4] = b"GET ";

/// Width of one response header.
pub const HEADER_SIZE: usize = 8;

/// Not-found sentinel; exactly [`HEADER_SIZE`] bytes.
pub const NOT_FOUND_SENTINEL: &[u8; HEADER_SIZE] = b"NOTFOUND";

/// Well-known port of the cache-serving endpoint on every node.
pub const DEFAULT_PORT: u16 = 5555;

// The name field is the frame minus the tag; `SampleName` enforces the same
// bound so every valid name encodes without truncation.
const _: () = assert!(REQUEST_SIZE - TAG_GET.len() == MAX_NAME_LEN);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("sample name does not fit the request frame ({0} > {MAX_NAME_LEN} bytes)")]
    NameTooLong(usize),
    #[error("request frame carries an unknown command tag")]
    BadTag,
    #[error("request frame carries an invalid sample name: {0}")]
    BadName(#[from] NameError),
    #[error("request frame carries a non-UTF-8 sample name")]
    NameNotUtf8,
    #[error("payload length {0} collides with the not-found sentinel encoding")]
    LengthUnencodable(u64),
}

/// Encodes a `GET` request frame for `name`.
pub fn encode_get(name: &SampleName) -> Result<[u8; REQUEST_SIZE], ProtoError> {
    let bytes = name.as_str().as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(ProtoError::NameTooLong(bytes.len()));
    }
    let mut frame = [0u8; REQUEST_SIZE];
    frame[..TAG_GET.len()].copy_from_slice(TAG_GET);
    frame[TAG_GET.len()..TAG_GET.len() + bytes.len()].copy_from_slice(bytes);
    Ok(frame)
}

/// Decodes a request frame back into the sample name it asks for.
pub fn decode_get(frame: &[u8; REQUEST_SIZE]) -> Result<SampleName, ProtoError> {
    if &frame[..TAG_GET.len()] != TAG_GET {
        return Err(ProtoError::BadTag);
    }
    let field = &frame[TAG_GET.len()..];
    let end = field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(MAX_NAME_LEN);
    let name = std::str::from_utf8(&field[..end]).map_err(|_| ProtoError::NameNotUtf8)?;
    Ok(SampleName::new(name)?)
}

/// Fixed-width response header: a definitive miss or the body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHeader {
    NotFound,
    Found(u64),
}

impl ResponseHeader {
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], ProtoError> {
        match self {
            ResponseHeader::NotFound => Ok(*NOT_FOUND_SENTINEL),
            ResponseHeader::Found(len) => {
                let bytes = len.to_le_bytes();
                // A real payload of this length would exceed 4 EiB; refusing
                // it keeps sentinel-first decoding unambiguous.
                if &bytes == NOT_FOUND_SENTINEL {
                    return Err(ProtoError::LengthUnencodable(*len));
                }
                Ok(bytes)
            }
        }
    }

    pub fn decode(bytes: [u8; HEADER_SIZE]) -> ResponseHeader {
        if &bytes == NOT_FOUND_SENTINEL {
            ResponseHeader::NotFound
        } else {
            ResponseHeader::Found(u64::from_le_bytes(bytes))
        }
    }
}
