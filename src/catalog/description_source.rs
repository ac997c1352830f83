//-----------------------------------------------------------------------------
// Module description_source
// Access to A2L description text by path, with an optional revision for cache validation

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

#[async_trait]
pub trait DescriptionSource: Send + Sync {
    /// Read the complete description text
    async fn read(&self, path: &str) -> std::io::Result<String>;

    /// Revision tag of the description, None if the source can not tell
    /// A changed revision invalidates cached decoded descriptions
    async fn revision(&self, _path: &str) -> std::io::Result<Option<String>> {
        Ok(None)
    }
}

//-------------------------------------------------------------------------------------------------
// FileDescriptionSource

/// Reads descriptions from the file system, relative paths are resolved against an optional base directory
#[derive(Debug, Clone, Default)]
pub struct FileDescriptionSource {
    base_dir: Option<PathBuf>,
}

impl FileDescriptionSource {
    pub fn new() -> FileDescriptionSource {
        FileDescriptionSource { base_dir: None }
    }

    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> FileDescriptionSource {
        FileDescriptionSource { base_dir: Some(base_dir.into()) }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl DescriptionSource for FileDescriptionSource {
    async fn read(&self, path: &str) -> std::io::Result<String> {
        let path = self.resolve(path);
        debug!("Read description {}", path.display());
        tokio::fs::read_to_string(&path).await
    }

    // Modification time and length of the file
    async fn revision(&self, path: &str) -> std::io::Result<Option<String>> {
        let metadata = tokio::fs::metadata(self.resolve(path)).await?;
        let modified = match metadata.modified() {
            Ok(t) => t.duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0),
            Err(_) => return Ok(None),
        };
        Ok(Some(format!("{}-{}", modified, metadata.len())))
    }
}

//-------------------------------------------------------------------------------------------------
// MemoryDescriptionSource

/// Descriptions held in memory, every insert creates a new revision
#[derive(Debug, Default)]
pub struct MemoryDescriptionSource {
    entries: Mutex<HashMap<String, (u64, String)>>,
    reads: Mutex<usize>,
}

impl MemoryDescriptionSource {
    pub fn new() -> MemoryDescriptionSource {
        MemoryDescriptionSource::default()
    }

    pub fn insert(&self, path: &str, text: &str) {
        let mut entries = self.entries.lock();
        let revision = entries.get(path).map(|(r, _)| r + 1).unwrap_or(0);
        entries.insert(path.to_string(), (revision, text.to_string()));
    }

    /// Number of successful reads so far
    pub fn read_count(&self) -> usize {
        *self.reads.lock()
    }
}

fn not_found(path: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, format!("no description `{}`", path))
}

#[async_trait]
impl DescriptionSource for MemoryDescriptionSource {
    async fn read(&self, path: &str) -> std::io::Result<String> {
        let text = self.entries.lock().get(path).map(|(_, t)| t.clone()).ok_or_else(|| not_found(path))?;
        *self.reads.lock() += 1;
        Ok(text)
    }

    async fn revision(&self, path: &str) -> std::io::Result<Option<String>> {
        let entries = self.entries.lock();
        let (revision, _) = entries.get(path).ok_or_else(|| not_found(path))?;
        Ok(Some(revision.to_string()))
    }
}

//-------------------------------------------------------------------------------------------------
