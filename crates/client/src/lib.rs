//! Remote side of vault synchronisation: the wire contract of the indexing
//! service, the session it issues, and the [`SyncClient`] that turns net file
//! changes into learn / forget calls.

pub mod client;
pub mod error;
pub mod filter;
pub mod remote;

pub use client::{SyncClient, SyncOutcome};
pub use error::ClientError;
pub use filter::ContentFilter;
pub use remote::{HttpRemote, Remote, Session};
