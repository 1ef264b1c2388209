//! Flat JSON backup tree mirroring the relational store.
//!
//! # Layout
//!
//! ```text
//! backup_dir/
//! ├── 3f5a…e1.json
//! └── 9b07…4c.json
//! ```
//!
//! One file per article, named by its identity key. Files are written to a dot-prefixed
//! temporary name and renamed into place, so a crash mid-write never leaves a torn
//! `<key>.json` behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::error::BackupWriteError;
use crate::models::{ArticleKey, BackupRecord};

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArticleKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Write (or overwrite) the record for `record.key`.
    #[instrument(level = "debug", skip_all, fields(key = %record.key))]
    pub async fn write(&self, record: &BackupRecord) -> Result<PathBuf, BackupWriteError> {
        let json = serde_json::to_vec_pretty(record).map_err(|source| BackupWriteError::Encode {
            key: record.key.clone(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error(&self.root, source))?;

        let path = self.path_for(&record.key);
        // Per-writer temp name; a run and a reconciliation may write the same key at once.
        let tmp = self
            .root
            .join(format!(".{}.{:08x}.json.tmp", record.key, rand::random::<u32>()));
        fs::write(&tmp, &json)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        if let Err(source) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(&path, source));
        }

        debug!(path = %path.display(), bytes = json.len(), "Wrote backup record");
        Ok(path)
    }

    pub async fn exists(&self, key: &ArticleKey) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Read a record back; `Ok(None)` when no file exists for `key`.
    pub async fn read(&self, key: &ArticleKey) -> std::io::Result<Option<BackupRecord>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn remove(&self, key: &ArticleKey) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Keys of every backup file present. A missing root is an empty tree.
    pub async fn keys(&self) -> std::io::Result<HashSet<ArticleKey>> {
        let mut keys = HashSet::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match ArticleKey::parse(stem) {
                Some(key) => {
                    keys.insert(key);
                }
                None => warn!(file = name, "Ignoring unrecognised file in backup directory"),
            }
        }
        Ok(keys)
    }

    pub async fn count(&self) -> std::io::Result<u64> {
        Ok(self.keys().await?.len() as u64)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BackupWriteError {
    BackupWriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(title: &str) -> BackupRecord {
        let now = Utc::now();
        BackupRecord {
            key: ArticleKey::derive(title, None),
            title: title.to_string(),
            subheadline: None,
            author: None,
            section: None,
            content: "Body".to_string(),
            date: None,
            image_urls: vec!["https://img.mlbstatic.com/a.jpg".to_string()],
            source_url: "https://www.milb.com/charleston/news/a".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_write_read_and_list() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("articles"));
        let rec = record("First");

        let path = store.write(&rec).await.unwrap();
        assert_eq!(path, store.path_for(&rec.key));
        assert!(store.exists(&rec.key).await);
        assert_eq!(store.read(&rec.key).await.unwrap(), Some(rec.clone()));
        assert_eq!(store.keys().await.unwrap(), HashSet::from([rec.key.clone()]));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_file() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let mut rec = record("Same");
        store.write(&rec).await.unwrap();
        rec.content = "Updated body".to_string();
        store.write(&rec).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let read = store.read(&rec.key).await.unwrap().unwrap();
        assert_eq!(read.content, "Updated body");
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("nope"));
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.read(&record("x").key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("articles");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = BackupStore::new(&blocker);
        let err = store.write(&record("Blocked")).await.unwrap_err();
        assert!(matches!(err, BackupWriteError::Io { .. }));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let rec = record("Gone");
        store.write(&rec).await.unwrap();
        store.remove(&rec.key).await.unwrap();
        store.remove(&rec.key).await.unwrap();
        assert!(!store.exists(&rec.key).await);
    }
}
