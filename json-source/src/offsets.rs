use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::OffsetStoreError;
use crate::tailer::{Offset, SourceIdentity};

/// Durable checkpoint storage: one committed offset per source identity.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns the last committed offset for the source, or `None` if it was never committed.
    async fn read_last_offset(
        &self,
        source: &SourceIdentity,
    ) -> Result<Option<Offset>, OffsetStoreError>;

    async fn commit(&self, source: &SourceIdentity, offset: Offset)
        -> Result<(), OffsetStoreError>;
}

/// Keeps offsets in memory. Clones share the same offsets.
#[derive(Clone, Default)]
pub struct MemoryOffsetStore {
    offsets: Arc<Mutex<HashMap<SourceIdentity, Offset>>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_offsets(offsets: impl IntoIterator<Item = (SourceIdentity, Offset)>) -> Self {
        Self {
            offsets: Arc::new(Mutex::new(offsets.into_iter().collect())),
        }
    }

    pub async fn get(&self, source: &SourceIdentity) -> Option<Offset> {
        self.offsets.lock().await.get(source).copied()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn read_last_offset(
        &self,
        source: &SourceIdentity,
    ) -> Result<Option<Offset>, OffsetStoreError> {
        Ok(self.get(source).await)
    }

    async fn commit(
        &self,
        source: &SourceIdentity,
        offset: Offset,
    ) -> Result<(), OffsetStoreError> {
        self.offsets.lock().await.insert(source.clone(), offset);
        Ok(())
    }
}

/// Stores offsets as a JSON object keyed by source identity.
///
/// Every commit rewrites the whole document to a sibling temporary file and renames it over
/// the previous one, so a crash mid-write leaves the last complete document in place.
pub struct FileOffsetStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Offset>, OffsetStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn read_last_offset(
        &self,
        source: &SourceIdentity,
    ) -> Result<Option<Offset>, OffsetStoreError> {
        let offsets = self.load().await?;
        Ok(offsets.get(source.as_str()).copied())
    }

    async fn commit(
        &self,
        source: &SourceIdentity,
        offset: Offset,
    ) -> Result<(), OffsetStoreError> {
        let _guard = self.write_lock.lock().await;

        let mut offsets = self.load().await?;
        offsets.insert(source.to_string(), offset);
        let json = serde_json::to_vec_pretty(&offsets)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(source = %source, offset, path = %self.path.display(), "committed offset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn identity(name: &str) -> SourceIdentity {
        SourceIdentity::from(format!("node-1-/var/log/{name}"))
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryOffsetStore::from_offsets([(identity("a.log"), 10)]);
        let handle = store.clone();

        assert_eq!(store.read_last_offset(&identity("a.log")).await.unwrap(), Some(10));
        assert_eq!(store.read_last_offset(&identity("b.log")).await.unwrap(), None);

        store.commit(&identity("a.log"), 42).await.unwrap();
        assert_eq!(handle.get(&identity("a.log")).await, Some(42));
    }

    #[tokio::test]
    async fn test_file_store_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileOffsetStore::new(temp_dir.path().join("offsets.json"));

        assert_eq!(store.read_last_offset(&identity("a.log")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("offsets.json");

        let store = FileOffsetStore::new(&path);
        store.commit(&identity("a.log"), 120).await.unwrap();
        store.commit(&identity("b.log"), 7).await.unwrap();
        store.commit(&identity("a.log"), 240).await.unwrap();

        let reopened = FileOffsetStore::new(&path);
        assert_eq!(reopened.read_last_offset(&identity("a.log")).await.unwrap(), Some(240));
        assert_eq!(reopened.read_last_offset(&identity("b.log")).await.unwrap(), Some(7));
        assert!(!store.temp_path().exists());

        let written: BTreeMap<String, u64> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written["node-1-/var/log/a.log"], 240);
    }

    #[tokio::test]
    async fn test_file_store_with_corrupted_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offsets.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileOffsetStore::new(&path);
        let result = store.read_last_offset(&identity("a.log")).await;
        assert!(matches!(result, Err(OffsetStoreError::Corrupted(_))));
    }
}
