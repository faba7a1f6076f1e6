//! Persisted index of vault files known to be synchronised.
//!
//! The vault content is the **source of truth**; this index is a cache that
//! lets a restarted process tell which files it already pushed.  Mutations
//! are applied in memory immediately and written back after a quiet period
//! (`commit_delay`), so a burst of changes costs a single write.  Between
//! commits the document on disk may lag the in-memory mapping;
//! [`IndexStore::flush_now`] closes that gap at shutdown.
//!
//! # On-disk format
//!
//! A single JSON object mapping vault path → metadata object:
//!
//! ```json
//! { "notes/today.md": {}, "inbox.md": {} }
//! ```
//!
//! Documents written by early releases were a bare array of paths; those are
//! still accepted on load and rewritten in the object form on the next commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::storage::Storage;

/// Per-file metadata.  Empty for now; reserved for a content hash or the
/// last successful sync time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredIndex {
    Entries(BTreeMap<String, IndexEntry>),
    Legacy(Vec<String>),
}

impl StoredIndex {
    fn into_entries(self) -> BTreeMap<String, IndexEntry> {
        match self {
            Self::Entries(entries) => entries,
            Self::Legacy(paths) => paths
                .into_iter()
                .map(|path| (path, IndexEntry::default()))
                .collect(),
        }
    }
}

struct Shared {
    entries: Mutex<BTreeMap<String, IndexEntry>>,
    storage: Arc<dyn Storage>,
    path: PathBuf,
    /// Bumped by every schedule or flush.  A delayed commit only writes when
    /// nothing newer has been scheduled since it was armed.
    generation: AtomicU64,
    /// Serialises writes.  A write that has started always runs to completion.
    write_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, IndexEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn supersede(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Serialise the mapping as it is *now* and replace the stored document.
    async fn commit(&self) -> Result<usize, IndexError> {
        let _writing = self.write_lock.lock().await;
        let (bytes, count) = {
            let entries = self.entries();
            let bytes = serde_json::to_vec_pretty(&*entries).map_err(IndexError::Encode)?;
            (bytes, entries.len())
        };
        self.storage
            .write(&self.path, &bytes)
            .await
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(count)
    }
}

pub struct IndexStore {
    shared: Arc<Shared>,
    commit_delay: Duration,
    pending_commit: Option<(JoinHandle<()>, u64)>,
}

impl IndexStore {
    /// Load the index stored at `path`, or start empty when nothing is stored.
    ///
    /// A document that exists but does not parse is an error.
    pub async fn load(
        storage: Arc<dyn Storage>,
        path: impl Into<PathBuf>,
        commit_delay: Duration,
    ) -> Result<Self, IndexError> {
        let path = path.into();
        let io_err = |source| IndexError::Io {
            path: path.clone(),
            source,
        };

        let entries = if storage.exists(&path).await.map_err(io_err)? {
            let raw = storage.read(&path).await.map_err(io_err)?;
            let stored: StoredIndex =
                serde_json::from_slice(&raw).map_err(|source| IndexError::Parse {
                    path: path.clone(),
                    source,
                })?;
            stored.into_entries()
        } else {
            BTreeMap::new()
        };

        info!(entries = entries.len(), path = %path.display(), "file index loaded");

        Ok(Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(entries),
                storage,
                path,
                generation: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
            }),
            commit_delay,
            pending_commit: None,
        })
    }

    /// Record `path` as known.  Idempotent; returns `true` when the path was
    /// not indexed before.  Schedules a delayed commit.
    pub fn upsert(&mut self, path: &str) -> bool {
        let inserted = self
            .shared
            .entries()
            .insert(path.to_string(), IndexEntry::default())
            .is_none();
        self.schedule_commit();
        inserted
    }

    /// Forget `path`.  Returns `true` when it was indexed.  Schedules a
    /// delayed commit.
    pub fn remove(&mut self, path: &str) -> bool {
        let removed = self.shared.entries().remove(path).is_some();
        self.schedule_commit();
        removed
    }

    /// Cancel any pending delayed commit and write the mapping now.  A delayed
    /// commit that is already writing is waited for, not interrupted.
    pub async fn flush_now(&mut self) -> Result<(), IndexError> {
        self.shared.supersede();
        self.pending_commit = None;
        let count = self.shared.commit().await?;
        debug!(entries = count, path = %self.shared.path.display(), "file index flushed");
        Ok(())
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending_commit
            .as_ref()
            .is_some_and(|(handle, generation)| {
                !handle.is_finished() && self.shared.is_current(*generation)
            })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.shared.entries().contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<IndexEntry> {
        self.shared.entries().get(path).cloned()
    }

    /// Sorted snapshot of every indexed path.
    pub fn paths(&self) -> Vec<String> {
        self.shared.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// (Re)arm the commit timer.  A timer that is already armed is
    /// superseded, so only the last mutation of a burst triggers a write.
    fn schedule_commit(&mut self) {
        let shared = Arc::clone(&self.shared);
        let generation = shared.supersede();
        let delay = self.commit_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.is_current(generation) {
                return;
            }
            match shared.commit().await {
                Ok(count) => {
                    debug!(entries = count, path = %shared.path.display(), "file index committed")
                }
                Err(err) => warn!(%err, "delayed index commit failed"),
            }
        });
        self.pending_commit = Some((handle, generation));
    }
}
