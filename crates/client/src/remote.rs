//! Wire contract of the remote indexing service.
//!
//! | Call            | Body                                                   |
//! |-----------------|--------------------------------------------------------|
//! | `POST /auth`    | JSON `{openai_key, source}` → JSON `{session_id}`      |
//! | `POST /learn`   | multipart: `session_id` text, `files` file part        |
//! | `DELETE /learn` | form-urlencoded `session_id=<id>&filename=<path>`      |

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Request, Response};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Value sent as `source` in the auth exchange.
const AUTH_SOURCE: &str = "obsidian";
/// Content type declared for every uploaded file part.
const LEARN_CONTENT_TYPE: &str = "text/markdown";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque server-issued token authorising learn / forget calls.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session(String);

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(..)")
    }
}

/// Remote operations the sync pipeline depends on.  Calls made without a
/// session still go out; the service decides whether to reject them.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn auth(&self, credential: &str) -> Result<Session, ClientError>;
    async fn learn(
        &self,
        session: Option<&Session>,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), ClientError>;
    async fn forget(&self, session: Option<&Session>, path: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    openai_key: &'a str,
    source: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    session_id: String,
}

/// [`Remote`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Transport {
                endpoint: base_url.clone(),
                source,
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}/{route}", self.base_url.trim_end_matches('/'))
    }

    pub fn auth_request(&self, credential: &str) -> Result<Request, ClientError> {
        let endpoint = self.endpoint("auth");
        let payload = AuthRequest {
            openai_key: credential,
            source: AUTH_SOURCE,
        };
        self.client
            .post(&endpoint)
            .json(&payload)
            .build()
            .map_err(|source| ClientError::Transport { endpoint, source })
    }

    pub fn learn_request(
        &self,
        session: Option<&Session>,
        path: &str,
        content: Vec<u8>,
    ) -> Result<Request, ClientError> {
        let endpoint = self.endpoint("learn");
        let file = Part::bytes(content)
            .file_name(path.to_string())
            .mime_str(LEARN_CONTENT_TYPE)
            .map_err(|source| ClientError::ContentType {
                path: path.to_string(),
                source,
            })?;
        let form = Form::new()
            .text("session_id", session_id(session))
            .part("files", file);
        self.client
            .post(&endpoint)
            .multipart(form)
            .build()
            .map_err(|source| ClientError::Transport { endpoint, source })
    }

    pub fn forget_request(
        &self,
        session: Option<&Session>,
        path: &str,
    ) -> Result<Request, ClientError> {
        let endpoint = self.endpoint("learn");
        let form = [("session_id", session_id(session)), ("filename", path.to_string())];
        self.client
            .delete(&endpoint)
            .form(&form)
            .build()
            .map_err(|source| ClientError::Transport { endpoint, source })
    }

    async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let endpoint = format!("{} {}", request.method(), request.url().path());
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|source| ClientError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                endpoint,
                status,
                body,
            });
        }
        Ok(response)
    }
}

fn session_id(session: Option<&Session>) -> String {
    session.map(|s| s.as_str().to_string()).unwrap_or_default()
}

#[async_trait]
impl Remote for HttpRemote {
    async fn auth(&self, credential: &str) -> Result<Session, ClientError> {
        let request = self.auth_request(credential)?;
        let response = self.send(request).await?;
        let body: AuthResponse = response
            .json()
            .await
            .map_err(|source| ClientError::Decode {
                endpoint: self.endpoint("auth"),
                source,
            })?;
        Ok(Session::new(body.session_id))
    }

    async fn learn(
        &self,
        session: Option<&Session>,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), ClientError> {
        let request = self.learn_request(session, path, content)?;
        self.send(request).await?;
        Ok(())
    }

    async fn forget(&self, session: Option<&Session>, path: &str) -> Result<(), ClientError> {
        let request = self.forget_request(session, path)?;
        self.send(request).await?;
        Ok(())
    }
}
