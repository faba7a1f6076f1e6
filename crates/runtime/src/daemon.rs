use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use vaultsync_client::{ContentFilter, HttpRemote, SyncClient};
use vaultsync_config::AppConfig;
use vaultsync_index::{FsStorage, IndexStore};

use crate::service::SyncService;
use crate::tracker::ChangeTracker;
use crate::vault::FsVault;

/// HTTP-backed sync client for the configured service, without a session.
pub fn build_client(config: &AppConfig) -> Result<SyncClient> {
    let remote = HttpRemote::new(config.remote.host.as_str())
        .with_context(|| format!("building HTTP client for {}", config.remote.host))?;
    let filter = ContentFilter::new(&config.sync.extensions);
    Ok(SyncClient::new(Arc::new(remote), filter))
}

/// Watch the configured vault and sync it through `client` until `shutdown`
/// resolves.
///
/// Startup order: load the index, start observing, then replay the vault's
/// current files so nothing written in between is missed.  On shutdown the
/// watcher stops first, pending changes are flushed through the pipeline,
/// and the index is written before this returns.
pub async fn run_watch(
    config: &AppConfig,
    client: SyncClient,
    shutdown: impl Future<Output = ()>,
) -> Result<SyncService> {
    let index_path = config.index_path();
    let index = IndexStore::load(Arc::new(FsStorage), &index_path, config.commit_delay())
        .await
        .with_context(|| format!("loading file index {}", index_path.display()))?;

    let vault = FsVault::open(config.vault_root(), config.vault.config_dir.as_str())
        .with_context(|| format!("opening vault {}", config.vault.path))?;
    let indexed = index.paths();

    let (tracker, batches, tracker_task) = ChangeTracker::spawn(config.debounce());
    let watcher = vault
        .watch(tracker.clone())
        .context("starting vault watcher")?;
    vault.replay_startup(&tracker, &indexed);

    let service = SyncService::new(index, client, Arc::new(vault));
    let service_task = tokio::spawn(service.run(batches));

    shutdown.await;
    info!("shutting down vault sync");

    drop(watcher);
    drop(tracker);
    tracker_task.await.context("change tracker task panicked")?;
    service_task.await.context("sync service task panicked")?
}
