//! Vault change pipeline: host events flow through the debounced
//! [`ChangeTracker`], are reduced to one net change per path, and are applied
//! to the file index and the remote service by [`SyncService`].

pub mod change;
pub mod coalescer;
mod daemon;
pub mod service;
pub mod tracker;
pub mod vault;

pub use change::{Change, ChangeBatch, ChangeKind, ChangeSet, HostEvent};
pub use coalescer::reduce;
pub use daemon::{build_client, run_watch};
pub use service::{DispatchError, DispatchReport, SyncService};
pub use tracker::{ChangeTracker, DEFAULT_DEBOUNCE};
pub use vault::{FsVault, Vault};
