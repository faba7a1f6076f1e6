use crate::change::{ChangeBatch, ChangeSet};

/// Collapse a batch to at most one change per path.  Later changes overwrite
/// earlier ones, so the last kind recorded for a path wins.
pub fn reduce(batch: ChangeBatch) -> ChangeSet {
    let mut set = ChangeSet::new();
    for change in batch {
        set.insert(change.path, change.kind);
    }
    set
}
