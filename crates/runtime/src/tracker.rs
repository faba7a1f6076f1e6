//! Change tracker: normalises host events and buffers them over a
//! quiet-time window.
//!
//! [`ChangeTracker::record`] is a non-blocking send into an unbounded stream.
//! A single background task owns the pending batch and one timer; every
//! arriving change pushes the deadline back by the debounce delay, so a batch
//! is delivered only after the stream has been quiet for that long.

use std::mem;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::change::{Change, ChangeBatch, ChangeKind, HostEvent};

/// Default quiet time before a batch is flushed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone)]
pub struct ChangeTracker {
    tx: mpsc::UnboundedSender<Change>,
}

impl ChangeTracker {
    /// Start the debounce task.  Batches are delivered on the returned
    /// receiver.  The task ends, after delivering whatever is still pending,
    /// once every clone of the tracker has been dropped.
    pub fn spawn(debounce: Duration) -> (Self, mpsc::UnboundedReceiver<ChangeBatch>, JoinHandle<()>) {
        let (tx, changes) = mpsc::unbounded_channel();
        let (batch_tx, batches) = mpsc::unbounded_channel();
        let handle = tokio::spawn(debounce_loop(changes, batch_tx, debounce));
        (Self { tx }, batches, handle)
    }

    pub fn record(&self, path: impl Into<String>, kind: ChangeKind) {
        let change = Change {
            path: path.into(),
            kind,
        };
        if self.tx.send(change).is_err() {
            debug!("change tracker stopped; dropping change");
        }
    }

    // Create and modify are the same net effect: a file copied in from
    // elsewhere shows up as a create.

    pub fn on_create(&self, path: impl Into<String>) {
        self.record(path, ChangeKind::Update);
    }

    pub fn on_modify(&self, path: impl Into<String>) {
        self.record(path, ChangeKind::Update);
    }

    /// Recorded as a delete of `old_path` followed by an update of
    /// `new_path`.  Metadata does not follow the file across the rename.
    pub fn on_rename(&self, new_path: impl Into<String>, old_path: impl Into<String>) {
        self.record(old_path, ChangeKind::Delete);
        self.record(new_path, ChangeKind::Update);
    }

    pub fn on_delete(&self, path: impl Into<String>) {
        self.record(path, ChangeKind::Delete);
    }

    pub fn handle(&self, event: HostEvent) {
        match event {
            HostEvent::Create(path) => self.on_create(path),
            HostEvent::Modify(path) => self.on_modify(path),
            HostEvent::Rename { from, to } => self.on_rename(to, from),
            HostEvent::Delete(path) => self.on_delete(path),
        }
    }
}

async fn debounce_loop(
    mut changes: mpsc::UnboundedReceiver<Change>,
    batches: mpsc::UnboundedSender<ChangeBatch>,
    debounce: Duration,
) {
    let mut pending: ChangeBatch = Vec::new();
    let timer = tokio::time::sleep(debounce);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => {
                    pending.push(change);
                    timer.as_mut().reset(Instant::now() + debounce);
                    armed = true;
                }
                None => break,
            },
            () = &mut timer, if armed => {
                armed = false;
                debug!(changes = pending.len(), "debounce window elapsed");
                if batches.send(mem::take(&mut pending)).is_err() {
                    return;
                }
            }
        }
    }

    // Input closed: hand over what is left instead of dropping it.
    if !pending.is_empty() {
        debug!(changes = pending.len(), "flushing pending changes on shutdown");
        let _ = batches.send(pending);
    }
}
