#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Lifecycle management of named shared-memory cache segments.
//!
//! A segment is a file under a configured root (normally on a `/dev/shm`
//! tmpfs) named by its [`SampleName`]. Once created it persists independent
//! of any single process until explicitly removed, which is what lets every
//! local process share one cached copy without re-transfer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use peercache_core::types::SampleName;

pub const DEFAULT_SEGMENT_ROOT: &str = "/dev/shm/peercache";

const TMP_MARKER: &str = ".tmp.";

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment not found: {0}")]
    NotFound(String),
    #[error("segment already exists: {0}")]
    AlreadyExists(String),
    #[error("segment handle is closed: {0}")]
    InvalidState(String),
    #[error("segment allocation failed (storage full or quota exceeded): {0}")]
    ResourceExhausted(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SegmentError {
    fn from_io(err: std::io::Error, name: &SampleName) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => SegmentError::NotFound(name.to_string()),
            ErrorKind::AlreadyExists => SegmentError::AlreadyExists(name.to_string()),
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
                SegmentError::ResourceExhausted(name.to_string())
            }
            _ => SegmentError::Io(err),
        }
    }
}

/// Explicit configuration so stores are independently testable against a
/// plain temp directory instead of the node's real tmpfs.
#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    pub root: PathBuf,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SEGMENT_ROOT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(config: SegmentStoreConfig) -> Self {
        Self { root: config.root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, name: &SampleName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Allocates a new named segment, failing with `AlreadyExists` if a
    /// segment of that name exists. Exclusivity is OS-enforced (`O_EXCL`),
    /// which is the invariant the create path relies on.
    pub fn create_exclusive(&self, name: &SampleName) -> Result<CacheEntry, SegmentError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.segment_path(name);
        let handle = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| SegmentError::from_io(err, name))?;
        Ok(CacheEntry {
            name: name.clone(),
            path,
            handle: Some(handle),
            size: 0,
        })
    }

    /// Exclusive create, falling back to attach when the segment already
    /// exists. Policy choice left to the caller per operation.
    pub fn create_or_get(&self, name: &SampleName) -> Result<CacheEntry, SegmentError> {
        match self.create_exclusive(name) {
            Ok(entry) => Ok(entry),
            Err(SegmentError::AlreadyExists(_)) => self.attach(name),
            Err(err) => Err(err),
        }
    }

    /// Obtains a handle to an existing segment. Never implicitly creates.
    pub fn attach(&self, name: &SampleName) -> Result<CacheEntry, SegmentError> {
        let path = self.segment_path(name);
        let handle = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|err| SegmentError::from_io(err, name))?;
        let size = handle.metadata()?.len();
        Ok(CacheEntry {
            name: name.clone(),
            path,
            handle: Some(handle),
            size,
        })
    }

    /// Destroys the segment permanently; subsequent attaches fail with
    /// `NotFound`. Irreversible.
    ///
    /// Removing a name that is already gone also reports `NotFound`, not a
    /// handle-state error: the store has no per-name lifecycle state of its
    /// own, so absence is the whole answer it can give.
    pub fn remove(&self, name: &SampleName) -> Result<(), SegmentError> {
        let path = self.segment_path(name);
        std::fs::remove_file(&path).map_err(|err| SegmentError::from_io(err, name))
    }

    /// Size of a populated segment, or `None` if the segment is absent or
    /// not yet populated. This is the local-hit check: a zero-length segment
    /// is a created-but-unwritten entry and does not count as cached.
    pub fn lookup(&self, name: &SampleName) -> Option<u64> {
        let meta = std::fs::metadata(self.segment_path(name)).ok()?;
        if meta.is_file() && meta.len() > 0 {
            Some(meta.len())
        } else {
            None
        }
    }

    /// Names of all populated segments, for the external index updater to
    /// advertise as this node's cache listing. In-progress tmp files are
    /// skipped.
    pub fn advertised_names(&self) -> Result<Vec<SampleName>, SegmentError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(SegmentError::Io(err)),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.contains(TMP_MARKER) {
                continue;
            }
            if let Ok(name) = SampleName::new(file_name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// One cached sample's segment, exclusively owning its OS handle from
/// create/attach until close/remove.
#[derive(Debug)]
pub struct CacheEntry {
    name: SampleName,
    path: PathBuf,
    handle: Option<File>,
    size: u64,
}

impl CacheEntry {
    pub fn name(&self) -> &SampleName {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Populates the segment with `bytes` in one shot.
    ///
    /// The payload is staged in a tmp sibling, synced, then renamed onto the
    /// segment name, so a concurrent reader observes either the previous
    /// content or the full new content, never a partial write. Writes for a
    /// given name must be serialized by the caller.
    pub fn put(&mut self, bytes: Vec<u8>) -> Result<(), SegmentError> {
        if self.handle.is_none() {
            return Err(SegmentError::InvalidState(self.name.to_string()));
        }

        let tmp = tmp_sibling(&self.path, &self.name)?;
        let write_result = (|| -> Result<(), std::io::Error> {
            let mut f = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            Ok(())
        })();
        if let Err(err) = write_result {
            let _ = std::fs::remove_file(&tmp);
            return Err(SegmentError::from_io(err, &self.name));
        }

        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(SegmentError::from_io(err, &self.name));
        }

        self.size = bytes.len() as u64;
        tracing::debug!(
            sample = %self.name,
            size = self.size,
            "segment populated"
        );
        Ok(())
    }

    /// Reads the segment's full current content; for a populated segment the
    /// returned length equals the segment size.
    pub fn read(&mut self) -> Result<Vec<u8>, SegmentError> {
        if self.handle.is_none() {
            return Err(SegmentError::InvalidState(self.name.to_string()));
        }
        let bytes =
            std::fs::read(&self.path).map_err(|err| SegmentError::from_io(err, &self.name))?;
        self.size = bytes.len() as u64;
        Ok(bytes)
    }

    /// Releases the handle; the segment and its content remain for other
    /// processes and future attaches. Idempotent.
    pub fn close(&mut self) {
        self.handle.take();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Destroys the segment, consuming the entry.
    pub fn remove(mut self) -> Result<(), SegmentError> {
        self.close();
        std::fs::remove_file(&self.path).map_err(|err| SegmentError::from_io(err, &self.name))
    }
}

fn tmp_sibling(path: &Path, name: &SampleName) -> Result<PathBuf, SegmentError> {
    let parent = path
        .parent()
        .ok_or_else(|| SegmentError::InvalidState(name.to_string()))?;
    Ok(parent.join(format!(
        "{}{TMP_MARKER}{}.{}",
        name.as_str(),
        std::process::id(),
        nanos_now()
    )))
}

fn nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn temp_store(test_name: &str) -> anyhow::Result<SegmentStore> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "peercache-segment-{}-{}-{}",
            test_name,
            std::process::id(),
            peercache_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(SegmentStore::new(SegmentStoreConfig { root }))
    }

    fn name(s: &str) -> SampleName {
        SampleName::new(s).unwrap()
    }

    #[test]
    fn attach_missing_is_not_found() -> anyhow::Result<()> {
        let store = temp_store("attach-missing")?;
        let err = store.attach(&name("never_created")).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn create_put_then_attach_observes_content() -> anyhow::Result<()> {
        let store = temp_store("create-put-attach")?;
        let n = name("img_0001.jpg");

        let mut writer = store.create_exclusive(&n)?;
        writer.put(b"payload bytes".to_vec())?;
        writer.close();

        let mut reader = store.attach(&n)?;
        assert_eq!(reader.size(), 13);
        assert_eq!(reader.read()?, b"payload bytes");
        Ok(())
    }

    #[test]
    fn create_exclusive_collision_is_already_exists() -> anyhow::Result<()> {
        let store = temp_store("exclusive-collision")?;
        let n = name("img_0002.jpg");

        let _first = store.create_exclusive(&n)?;
        let err = store.create_exclusive(&n).unwrap_err();
        assert!(matches!(err, SegmentError::AlreadyExists(_)));
        Ok(())
    }

    #[test]
    fn create_or_get_attaches_to_existing() -> anyhow::Result<()> {
        let store = temp_store("create-or-get")?;
        let n = name("img_0003.jpg");

        let mut writer = store.create_exclusive(&n)?;
        writer.put(b"abc".to_vec())?;
        writer.close();

        let mut second = store.create_or_get(&n)?;
        assert_eq!(second.read()?, b"abc");
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_invalidates_io() -> anyhow::Result<()> {
        let store = temp_store("close-idempotent")?;
        let n = name("img_0004.jpg");

        let mut entry = store.create_exclusive(&n)?;
        entry.close();
        entry.close();
        assert!(entry.is_closed());

        let err = entry.put(b"late".to_vec()).unwrap_err();
        assert!(matches!(err, SegmentError::InvalidState(_)));
        let err = entry.read().unwrap_err();
        assert!(matches!(err, SegmentError::InvalidState(_)));
        Ok(())
    }

    #[test]
    fn remove_makes_attach_not_found() -> anyhow::Result<()> {
        let store = temp_store("remove")?;
        let n = name("img_0005.jpg");

        let mut entry = store.create_exclusive(&n)?;
        entry.put(b"x".to_vec())?;
        entry.remove()?;

        let err = store.attach(&n).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound(_)));

        let err = store.remove(&n).unwrap_err();
        assert!(matches!(err, SegmentError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn lookup_reports_populated_segments_only() -> anyhow::Result<()> {
        let store = temp_store("lookup")?;
        let n = name("img_0006.jpg");

        assert_eq!(store.lookup(&n), None);

        let mut entry = store.create_exclusive(&n)?;
        assert_eq!(store.lookup(&n), None, "unwritten segment is not cached");

        entry.put(vec![7u8; 1024])?;
        assert_eq!(store.lookup(&n), Some(1024));
        Ok(())
    }

    #[test]
    fn advertised_names_skip_tmp_and_empty() -> anyhow::Result<()> {
        let store = temp_store("advertised")?;

        let mut a = store.create_exclusive(&name("a.jpg"))?;
        a.put(b"1".to_vec())?;
        let _empty = store.create_exclusive(&name("b.jpg"))?;
        std::fs::write(store.root().join("c.jpg.tmp.1.2"), b"partial")?;

        let names = store.advertised_names()?;
        assert_eq!(names, vec![name("a.jpg")]);
        Ok(())
    }

    #[test]
    fn exclusive_create_has_single_winner() -> anyhow::Result<()> {
        let store = Arc::new(temp_store("single-winner")?);
        let n = name("contended.jpg");

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..threads {
            let store = store.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            let n = n.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                if store.create_exclusive(&n).is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn put_replaces_content_atomically_for_reader() -> anyhow::Result<()> {
        let store = temp_store("atomic-replace")?;
        let n = name("img_0007.jpg");

        let mut writer = store.create_exclusive(&n)?;
        writer.put(vec![1u8; 4096])?;

        let mut reader = store.attach(&n)?;
        let got = reader.read()?;
        assert!(got == vec![1u8; 4096]);
        Ok(())
    }
}
