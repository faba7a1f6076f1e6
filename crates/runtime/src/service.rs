//! Sync service: single owner of the file index and the sync client.
//!
//! For every delivered batch the service reduces it to a [`ChangeSet`],
//! applies each net change to the index *first*, then dispatches the remote
//! calls.  A failed call therefore leaves local and remote state apart; the
//! next change to the same path brings them back together.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use vaultsync_client::{ClientError, SyncClient, SyncOutcome};
use vaultsync_index::IndexStore;

use crate::change::{ChangeBatch, ChangeKind, ChangeSet};
use crate::coalescer::reduce;
use crate::vault::Vault;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Remote(#[from] ClientError),
}

/// Result of syncing one path.
#[derive(Debug)]
pub struct DispatchReport {
    pub path: String,
    pub kind: ChangeKind,
    pub result: Result<SyncOutcome, DispatchError>,
}

pub struct SyncService {
    index: IndexStore,
    client: SyncClient,
    vault: Arc<dyn Vault>,
    in_flight: JoinSet<Vec<DispatchReport>>,
}

impl SyncService {
    pub fn new(index: IndexStore, client: SyncClient, vault: Arc<dyn Vault>) -> Self {
        Self {
            index,
            client,
            vault,
            in_flight: JoinSet::new(),
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Apply `set` to the index and return the pending remote dispatch.
    ///
    /// Index mutations happen before this returns.  The returned future owns
    /// everything it needs, so it can be spawned; calls for distinct paths run
    /// concurrently.
    pub fn apply(
        &mut self,
        set: ChangeSet,
    ) -> impl Future<Output = Vec<DispatchReport>> + Send + use<> {
        for (path, kind) in &set {
            match kind {
                ChangeKind::Delete => {
                    self.index.remove(path);
                }
                ChangeKind::Update => {
                    self.index.upsert(path);
                }
            }
        }

        let client = self.client.clone();
        let vault = Arc::clone(&self.vault);
        async move {
            let calls = set.into_iter().map(|(path, kind)| {
                let client = &client;
                let vault = &vault;
                async move {
                    let result = sync_path(client, vault.as_ref(), &path, kind).await;
                    log_report(&path, kind, &result);
                    DispatchReport { path, kind, result }
                }
            });
            join_all(calls).await
        }
    }

    fn spawn_batch(&mut self, batch: ChangeBatch) {
        let set = reduce(batch);
        debug!(paths = set.len(), "change batch coalesced");
        let dispatch = self.apply(set);
        self.in_flight.spawn(dispatch);
    }

    /// Consume batches until the stream ends, then wait for in-flight calls
    /// and flush the index.  New batches are accepted while earlier calls are
    /// still running.
    pub async fn run(mut self, mut batches: mpsc::UnboundedReceiver<ChangeBatch>) -> Result<Self> {
        loop {
            tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => self.spawn_batch(batch),
                    None => break,
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(err) = joined {
                        warn!(%err, "sync dispatch task failed");
                    }
                }
            }
        }

        self.shutdown().await?;
        Ok(self)
    }

    /// Wait for in-flight calls, then write the index synchronously.
    pub async fn shutdown(&mut self) -> Result<()> {
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "sync dispatch task failed");
            }
        }
        self.index
            .flush_now()
            .await
            .context("flushing file index on shutdown")?;
        info!(entries = self.index.len(), "sync service stopped");
        Ok(())
    }
}

async fn sync_path(
    client: &SyncClient,
    vault: &dyn Vault,
    path: &str,
    kind: ChangeKind,
) -> Result<SyncOutcome, DispatchError> {
    match kind {
        ChangeKind::Delete => Ok(client.forget(path).await?),
        ChangeKind::Update => {
            if !client.accepts(path) {
                return Ok(SyncOutcome::Skipped);
            }
            let content = vault.read_file(path).await.map_err(|source| DispatchError::Read {
                path: path.to_string(),
                source,
            })?;
            Ok(client.upload_and_learn(path, content).await?)
        }
    }
}

fn log_report(path: &str, kind: ChangeKind, result: &Result<SyncOutcome, DispatchError>) {
    match result {
        Ok(SyncOutcome::Skipped) => debug!(path, "not eligible for remote sync"),
        Ok(outcome) => info!(path, ?outcome, "synced"),
        Err(DispatchError::Remote(err)) => {
            warn!(path, ?kind, rejected = err.is_rejection(), %err, "remote sync failed")
        }
        Err(err) => warn!(path, ?kind, %err, "remote sync failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use vaultsync_client::error::StatusCode;
    use vaultsync_client::{ClientError, ContentFilter, Remote, Session, SyncClient, SyncOutcome};
    use vaultsync_index::{IndexStore, MemoryStorage};

    use super::{DispatchError, DispatchReport, SyncService};
    use crate::change::{Change, ChangeBatch, ChangeKind};
    use crate::coalescer::reduce;
    use crate::tracker::ChangeTracker;
    use crate::vault::Vault;

    const INDEX: &str = "/vault/.obsidian/vaultsync/index.json";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Learn(Option<String>, String, String),
        Forget(Option<String>, String),
    }

    #[derive(Default)]
    struct FakeRemote {
        calls: Mutex<Vec<Call>>,
        down: bool,
    }

    impl FakeRemote {
        fn calls(&self) -> Vec<Call> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort_by_key(|call| format!("{call:?}"));
            calls
        }

        fn outcome(&self) -> Result<(), ClientError> {
            if self.down {
                return Err(ClientError::Status {
                    endpoint: "POST /learn".to_string(),
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: String::new(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Remote for FakeRemote {
        async fn auth(&self, _credential: &str) -> Result<Session, ClientError> {
            Ok(Session::new("issued"))
        }

        async fn learn(
            &self,
            session: Option<&Session>,
            path: &str,
            content: Vec<u8>,
        ) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(Call::Learn(
                session.map(|s| s.as_str().to_string()),
                path.to_string(),
                String::from_utf8(content).unwrap(),
            ));
            self.outcome()
        }

        async fn forget(&self, session: Option<&Session>, path: &str) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(Call::Forget(
                session.map(|s| s.as_str().to_string()),
                path.to_string(),
            ));
            self.outcome()
        }
    }

    #[derive(Default)]
    struct FakeVault {
        files: HashMap<String, String>,
    }

    impl FakeVault {
        fn with(files: &[&str]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|f| (f.to_string(), format!("body of {f}")))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Vault for FakeVault {
        async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
            self.files
                .get(path)
                .map(|body| body.clone().into_bytes())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
        }
    }

    async fn dispatch(service: &mut SyncService, batch: ChangeBatch) -> Vec<DispatchReport> {
        service.apply(reduce(batch)).await
    }

    async fn service(
        remote: &Arc<FakeRemote>,
        storage: &Arc<MemoryStorage>,
        vault: FakeVault,
    ) -> SyncService {
        let index = IndexStore::load(storage.clone(), INDEX, Duration::from_secs(2))
            .await
            .unwrap();
        let client = SyncClient::new(remote.clone(), ContentFilter::default());
        SyncService::new(index, client, Arc::new(vault))
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_batch_issues_one_call_per_path() {
        let remote = Arc::new(FakeRemote::default());
        let storage = Arc::new(MemoryStorage::new());
        let mut service = service(&remote, &storage, FakeVault::with(&["a.md"])).await;

        let reports = dispatch(
            &mut service,
            vec![
                Change::update("a.md"),
                Change::update("a.md"),
                Change::delete("b.md"),
            ],
        )
        .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(
            remote.calls(),
            vec![
                Call::Forget(None, "b.md".to_string()),
                Call::Learn(None, "a.md".to_string(), "body of a.md".to_string()),
            ]
        );
        assert!(service.index().contains("a.md"));
        assert!(!service.index().contains("b.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_passed_to_every_call() {
        let remote = Arc::new(FakeRemote::default());
        let storage = Arc::new(MemoryStorage::new());
        let index = IndexStore::load(storage.clone(), INDEX, Duration::from_secs(2))
            .await
            .unwrap();
        let mut client = SyncClient::new(remote.clone(), ContentFilter::default());
        client.authenticate("sk", Some("stored")).await.unwrap();
        let mut service = SyncService::new(index, client, Arc::new(FakeVault::with(&["a.md"])));

        dispatch(&mut service, vec![Change::update("a.md"), Change::delete("c.md")]).await;
        assert_eq!(
            remote.calls(),
            vec![
                Call::Forget(Some("issued".to_string()), "c.md".to_string()),
                Call::Learn(
                    Some("issued".to_string()),
                    "a.md".to_string(),
                    "body of a.md".to_string()
                ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_files_update_index_without_network() {
        let remote = Arc::new(FakeRemote::default());
        let storage = Arc::new(MemoryStorage::new());
        let mut service = service(&remote, &storage, FakeVault::default()).await;

        let reports = dispatch(&mut service, vec![Change::update("photo.png")]).await;
        assert!(matches!(reports[0].result, Ok(SyncOutcome::Skipped)));
        assert!(remote.calls().is_empty());
        assert!(service.index().contains("photo.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_keeps_index_mutation() {
        let remote = Arc::new(FakeRemote {
            down: true,
            ..FakeRemote::default()
        });
        let storage = Arc::new(MemoryStorage::new());
        let mut service = service(&remote, &storage, FakeVault::with(&["a.md"])).await;

        let reports = dispatch(&mut service, vec![Change::update("a.md")]).await;
        assert!(matches!(reports[0].result, Err(DispatchError::Remote(_))));
        assert_eq!(reports[0].kind, ChangeKind::Update);
        assert!(service.index().contains("a.md"), "index is updated before the call");
        assert_eq!(remote.calls().len(), 1, "no retry");
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_file_is_reported() {
        let remote = Arc::new(FakeRemote::default());
        let storage = Arc::new(MemoryStorage::new());
        let mut service = service(&remote, &storage, FakeVault::default()).await;

        let reports = dispatch(&mut service, vec![Change::update("vanished.md")]).await;
        assert!(matches!(reports[0].result, Err(DispatchError::Read { .. })));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_runs_until_tracker_closes_then_flushes_index() {
        let remote = Arc::new(FakeRemote::default());
        let storage = Arc::new(MemoryStorage::new());
        let service = service(&remote, &storage, FakeVault::with(&["a.md", "c.md"])).await;

        let (tracker, batches, tracker_task) = ChangeTracker::spawn(Duration::from_secs(5));
        let running = tokio::spawn(service.run(batches));

        tracker.on_create("a.md");
        tracker.on_modify("a.md");
        tracker.on_delete("b.md");
        tokio::time::sleep(Duration::from_secs(6)).await;

        // Second window, interrupted by shutdown before it goes quiet.
        tracker.on_rename("c.md", "a.md");
        drop(tracker);
        tracker_task.await.unwrap();

        let service = running.await.unwrap().unwrap();
        assert_eq!(
            remote.calls(),
            vec![
                Call::Forget(None, "a.md".to_string()),
                Call::Forget(None, "b.md".to_string()),
                Call::Learn(None, "a.md".to_string(), "body of a.md".to_string()),
                Call::Learn(None, "c.md".to_string(), "body of c.md".to_string()),
            ]
        );
        assert_eq!(service.index().paths(), vec!["c.md"]);

        let stored = storage.contents(Path::new(INDEX)).expect("index flushed");
        let stored: serde_json::Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(stored, serde_json::json!({ "c.md": {} }));
    }
}
