use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl Change {
    pub fn update(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Update,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Delete,
        }
    }
}

/// Changes recorded during one debounce window, in arrival order.
pub type ChangeBatch = Vec<Change>;

/// Net effect of a batch: the last change kind seen for each path.
pub type ChangeSet = BTreeMap<String, ChangeKind>;

/// Raw lifecycle notification from the host that owns the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Create(String),
    Modify(String),
    Rename { from: String, to: String },
    Delete(String),
}
