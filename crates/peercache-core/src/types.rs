use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One machine/process group participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum encoded length of a sample name in bytes.
///
/// This is the request frame width minus the command tag, so every valid
/// `SampleName` fits in one wire request unmodified.
pub const MAX_NAME_LEN: usize = 96;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("sample name must be non-empty")]
    Empty,
    #[error("sample name must not contain path separators or '..': {0}")]
    InvalidComponent(String),
    #[error("sample name exceeds {MAX_NAME_LEN} bytes: {0}")]
    TooLong(String),
}

/// Canonical identifier of one immutable dataset sample.
///
/// The name doubles as the shared-memory segment name and as the key
/// exchanged in the wire protocol, so it is validated on construction:
/// non-empty, no `/` or `\`, no `..`, at most [`MAX_NAME_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleName(String);

impl SampleName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(NameError::Empty);
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(NameError::InvalidComponent(name));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(name));
        }
        Ok(Self(name))
    }

    /// Derives the canonical name from a sample's source path by flattening
    /// path separators to `_`. Deterministic: the same path always maps to
    /// the same name on every node.
    pub fn from_source_path(path: &str) -> Result<Self, NameError> {
        let flattened = path.trim().trim_start_matches('/').replace('/', "_");
        Self::new(flattened)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SampleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SampleName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SampleName> for String {
    fn from(value: SampleName) -> Self {
        value.0
    }
}

/// A half-open `[start, end)` slice of an ordered prefetch name list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchWindow {
    pub start: usize,
    pub end: usize,
}

impl PrefetchWindow {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.start <= idx && idx < self.end
    }

    /// Clamps the window to a list of `len` items.
    pub fn clamp_to(&self, len: usize) -> PrefetchWindow {
        PrefetchWindow {
            start: self.start.min(len),
            end: self.end.min(len),
        }
    }
}
