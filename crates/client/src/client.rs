use std::sync::Arc;

use tracing::{debug, info};

use crate::error::ClientError;
use crate::filter::ContentFilter;
use crate::remote::{Remote, Session};

/// What a sync call did for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Content was sent to the learn endpoint.
    Learned,
    /// The path was removed from the remote index.
    Forgotten,
    /// Not eligible for remote sync; tracked in the local index only.
    Skipped,
}

/// Pushes net file changes to the remote service.
///
/// Owns the current [`Session`] and hands it to every call explicitly.
/// Calls are never retried here.
#[derive(Clone)]
pub struct SyncClient {
    remote: Arc<dyn Remote>,
    filter: ContentFilter,
    session: Option<Session>,
}

impl SyncClient {
    pub fn new(remote: Arc<dyn Remote>, filter: ContentFilter) -> Self {
        Self {
            remote,
            filter,
            session: None,
        }
    }

    /// Startup auth.  The exchange runs only when a session identifier has
    /// already been stored; with nothing stored the session stays unset and
    /// later calls go out without one.
    pub async fn authenticate(
        &mut self,
        credential: &str,
        stored_session_id: Option<&str>,
    ) -> Result<Option<&Session>, ClientError> {
        if stored_session_id.is_none() {
            debug!("no stored session id, skipping auth");
            return Ok(None);
        }
        self.authenticate_now(credential).await.map(Some)
    }

    /// Exchange `credential` for a fresh session unconditionally.
    pub async fn authenticate_now(&mut self, credential: &str) -> Result<&Session, ClientError> {
        let session = self.remote.auth(credential).await?;
        info!("remote session established");
        Ok(self.session.insert(session))
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn accepts(&self, path: &str) -> bool {
        self.filter.accepts(path)
    }

    /// Send `content` to the learn endpoint when `path` passes the content
    /// filter; otherwise a no-op [`SyncOutcome::Skipped`].
    pub async fn upload_and_learn(
        &self,
        path: &str,
        content: Vec<u8>,
    ) -> Result<SyncOutcome, ClientError> {
        if !self.accepts(path) {
            return Ok(SyncOutcome::Skipped);
        }
        self.remote
            .learn(self.session.as_ref(), path, content)
            .await?;
        Ok(SyncOutcome::Learned)
    }

    pub async fn forget(&self, path: &str) -> Result<SyncOutcome, ClientError> {
        self.remote.forget(self.session.as_ref(), path).await?;
        Ok(SyncOutcome::Forgotten)
    }
}
