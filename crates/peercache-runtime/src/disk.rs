use std::path::PathBuf;

use anyhow::Result;

use peercache_core::types::SampleName;

/// Disk-read collaborator for samples no node caches.
///
/// Synchronous by design: implementations do blocking I/O and the runtime
/// runs them on the blocking pool, off any latency-sensitive consumer
/// thread. `Ok(None)` means the sample is not on this node's disk either.
pub trait DiskSource: Send + Sync + 'static {
    fn read_sample(&self, name: &SampleName) -> Result<Option<Vec<u8>>>;
}

/// Reads samples from a directory keyed by canonical name.
#[derive(Debug, Clone)]
pub struct DirDiskSource {
    root: PathBuf,
}

impl DirDiskSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DiskSource for DirDiskSource {
    fn read_sample(&self, name: &SampleName) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(name.as_str());
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("disk read failed for {}", path.display()))),
        }
    }
}
