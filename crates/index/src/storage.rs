//! Durable key/value byte storage used to persist the file index.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &Path) -> io::Result<bool>;
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Replace the whole content stored at `path`.
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

// ── Filesystem ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

#[async_trait]
impl Storage for FsStorage {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    /// Crash-safe replace: the bytes go to a `.tmp` sibling which is synced
    /// and then renamed over `path`.  The `.tmp` file is removed on any error.
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "index.json".to_string());
            path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(())
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// Volatile storage that counts writes.  Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `path` without counting it as a write.
    pub fn with_file(self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.into(), bytes.into());
        self
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.contents(path).is_some())
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.contents(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
        })
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_path_buf(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
