//! Filesystem host: exposes the vault's files to the sync pipeline and turns
//! `notify` events into host lifecycle events.
//!
//! Paths handed to the pipeline are vault-relative and `/`-separated.  The
//! host's private configuration directory (which also holds the persisted
//! index) is invisible to the pipeline.

use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::change::HostEvent;
use crate::tracker::ChangeTracker;

/// Read access to file content, keyed by vault path.
#[async_trait]
pub trait Vault: Send + Sync {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
}

/// Filesystem vault.
///
/// Folder-level notifications (a folder renamed, moved in or moved out) are
/// expanded to one host event per file.  The files under a folder that has
/// already left the disk can only be recovered from memory, so the vault keeps
/// the set of files it has seen; clones share that set.
#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
    config_dir: String,
    known: Arc<Mutex<BTreeSet<String>>>,
}

impl FsVault {
    /// Open the vault at `root`.  `config_dir` names the top-level directory
    /// excluded from observation.
    pub fn open(root: impl AsRef<Path>, config_dir: impl Into<String>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        let vault = Self {
            root,
            config_dir: config_dir.into(),
            known: Arc::default(),
        };
        let files = vault.scan();
        *vault.known() = files.into_iter().collect();
        Ok(vault)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn known(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Vault path for an absolute filesystem path, or `None` when the path is
    /// outside the vault or inside the private configuration directory.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        if parts.is_empty() || parts[0] == self.config_dir {
            return None;
        }
        Some(parts.join("/"))
    }

    fn absolute(&self, path: &str) -> PathBuf {
        path.split('/').fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn is_config_dir(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path.file_name().and_then(|name| name.to_str()) == Some(self.config_dir.as_str())
    }

    /// Every vault file below `dir`, sorted.
    fn walk(&self, dir: &Path) -> Vec<String> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_config_dir(entry.path()))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(%err, "skipping unreadable vault entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.relative(entry.path()))
            .collect()
    }

    /// Every file currently in the vault, sorted.
    pub fn scan(&self) -> Vec<String> {
        self.walk(&self.root)
    }

    /// The file at `path`, or every file under it when it is a folder.
    fn files_under(&self, path: &Path) -> Vec<String> {
        if path.is_dir() {
            self.walk(path)
        } else {
            self.relative(path).into_iter().collect()
        }
    }

    /// Known files at or below the vault path `rel`.  Used for paths that are
    /// gone from disk, where a folder can no longer be told apart from a file.
    fn known_under(&self, rel: &str) -> Vec<String> {
        let known = self.known();
        if known.contains(rel) {
            return vec![rel.to_string()];
        }
        let prefix = format!("{rel}/");
        known
            .range(prefix.clone()..)
            .take_while(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn relative_all<'a>(&'a self, paths: &'a [PathBuf]) -> impl Iterator<Item = String> + 'a {
        paths.iter().filter_map(|path| self.relative(path))
    }

    /// Startup replay: a create for every file in the vault, then a delete
    /// for every indexed path that no longer exists (removed while the
    /// process was not running).
    pub fn replay_startup(&self, tracker: &ChangeTracker, indexed: &[String]) -> usize {
        let present = self.scan();
        let existing = present.iter().cloned().collect::<BTreeSet<_>>();
        let mut replayed = 0usize;

        for path in present {
            tracker.on_create(path);
            replayed += 1;
        }
        for path in indexed.iter().filter(|path| !existing.contains(*path)) {
            tracker.on_delete(path.clone());
            replayed += 1;
        }
        *self.known() = existing;

        info!(events = replayed, root = %self.root.display(), "startup replay queued");
        replayed
    }

    /// Translate one `notify` event into per-file host events.
    pub fn host_events(&self, event: &Event) -> Vec<HostEvent> {
        let events: Vec<HostEvent> = match event.kind {
            EventKind::Create(_) => event
                .paths
                .iter()
                .flat_map(|path| self.files_under(path))
                .map(HostEvent::Create)
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                match (event.paths.first(), event.paths.get(1)) {
                    (Some(from), Some(to)) => self.renamed(from, to),
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => self
                .relative_all(&event.paths)
                .flat_map(|rel| self.known_under(&rel))
                .map(HostEvent::Delete)
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
                .paths
                .iter()
                .flat_map(|path| self.files_under(path))
                .map(HostEvent::Create)
                .collect(),
            // Rename halves that could not be paired: decide by what is on disk now.
            EventKind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .flat_map(|path| {
                    if path.exists() {
                        self.files_under(path)
                            .into_iter()
                            .map(HostEvent::Create)
                            .collect::<Vec<_>>()
                    } else {
                        self.relative(path)
                            .map(|rel| self.known_under(&rel))
                            .unwrap_or_default()
                            .into_iter()
                            .map(HostEvent::Delete)
                            .collect()
                    }
                })
                .collect(),
            EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
            EventKind::Modify(_) => event
                .paths
                .iter()
                .filter(|path| !path.is_dir())
                .filter_map(|path| self.relative(path))
                .map(HostEvent::Modify)
                .collect(),
            EventKind::Remove(RemoveKind::File) => self
                .relative_all(&event.paths)
                .map(HostEvent::Delete)
                .collect(),
            EventKind::Remove(_) => self
                .relative_all(&event.paths)
                .flat_map(|rel| self.known_under(&rel))
                .map(HostEvent::Delete)
                .collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        };

        self.track(&events);
        events
    }

    /// A paired rename.  Either side may fall outside the observed tree, which
    /// makes it a move in or a move out.
    fn renamed(&self, from: &Path, to: &Path) -> Vec<HostEvent> {
        let (from, to_rel) = match (self.relative(from), self.relative(to)) {
            (Some(from), Some(to_rel)) => (from, to_rel),
            (Some(from), None) => {
                return self
                    .known_under(&from)
                    .into_iter()
                    .map(HostEvent::Delete)
                    .collect();
            }
            (None, _) => {
                return self
                    .files_under(to)
                    .into_iter()
                    .map(HostEvent::Create)
                    .collect();
            }
        };

        if !to.is_dir() {
            return vec![HostEvent::Rename { from, to: to_rel }];
        }

        // Folder rename: carry each file across, keyed by its path below the folder.
        let mut left_behind = self.known_under(&from).into_iter().collect::<BTreeSet<_>>();
        let mut events = Vec::new();
        for new_path in self.walk(to) {
            let old_path = new_path
                .strip_prefix(to_rel.as_str())
                .map(|suffix| format!("{from}{suffix}"));
            match old_path {
                Some(old_path) if left_behind.remove(&old_path) => events.push(HostEvent::Rename {
                    from: old_path,
                    to: new_path,
                }),
                _ => events.push(HostEvent::Create(new_path)),
            }
        }
        events.extend(left_behind.into_iter().map(HostEvent::Delete));
        events
    }

    fn track(&self, events: &[HostEvent]) {
        if events.is_empty() {
            return;
        }
        let mut known = self.known();
        for event in events {
            match event {
                HostEvent::Create(path) | HostEvent::Modify(path) => {
                    known.insert(path.clone());
                }
                HostEvent::Delete(path) => {
                    known.remove(path);
                }
                HostEvent::Rename { from, to } => {
                    known.remove(from);
                    known.insert(to.clone());
                }
            }
        }
    }

    /// Watch the vault recursively, feeding translated events to `tracker`.
    /// Dropping the returned watcher stops observation.
    pub fn watch(&self, tracker: ChangeTracker) -> notify::Result<RecommendedWatcher> {
        let vault = self.clone();
        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for host_event in vault.host_events(&event) {
                    debug!(?host_event, "vault event");
                    tracker.handle(host_event);
                }
            }
            Err(err) => warn!(%err, "vault watcher error"),
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        info!(root = %self.root.display(), "watching vault");
        Ok(watcher)
    }
}

#[async_trait]
impl Vault for FsVault {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.absolute(path)).await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use notify::event::{CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind, RenameMode};
    use notify::{Event, EventKind};
    use tempfile::TempDir;

    use super::{FsVault, Vault};
    use crate::change::{Change, HostEvent};
    use crate::tracker::ChangeTracker;

    fn vault_with(files: &[&str]) -> (TempDir, FsVault) {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("content of {file}")).unwrap();
        }
        let vault = FsVault::open(dir.path(), ".obsidian").unwrap();
        (dir, vault)
    }

    fn event(kind: EventKind, vault: &FsVault, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |ev, p| ev.add_path(vault.root().join(p)))
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let (_dir, vault) = vault_with(&[]);
        let abs = vault.root().join("notes").join("daily.md");
        assert_eq!(vault.relative(&abs).as_deref(), Some("notes/daily.md"));
    }

    #[test]
    fn config_dir_and_outside_paths_are_hidden() {
        let (_dir, vault) = vault_with(&[]);
        let private = vault.root().join(".obsidian/vaultsync/index.json");
        assert_eq!(vault.relative(&private), None);
        assert_eq!(vault.relative(&PathBuf::from("/elsewhere/a.md")), None);
        assert_eq!(vault.relative(vault.root()), None);
    }

    #[test]
    fn scan_lists_files_outside_config_dir() {
        let (_dir, vault) = vault_with(&["b.md", "a/c.md", ".obsidian/workspace.json", "img.png"]);
        assert_eq!(vault.scan(), vec!["a/c.md", "b.md", "img.png"]);
    }

    #[tokio::test]
    async fn read_file_resolves_vault_paths() {
        let (_dir, vault) = vault_with(&["a/c.md"]);
        let content = vault.read_file("a/c.md").await.unwrap();
        assert_eq!(content, b"content of a/c.md");
        assert!(vault.read_file("missing.md").await.is_err());
    }

    #[test]
    fn create_and_modify_map_to_host_events() {
        let (_dir, vault) = vault_with(&["a.md"]);
        assert_eq!(
            vault.host_events(&event(EventKind::Create(CreateKind::File), &vault, &["a.md"])),
            vec![HostEvent::Create("a.md".to_string())]
        );
        assert_eq!(
            vault.host_events(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &vault,
                &["a.md"]
            )),
            vec![HostEvent::Modify("a.md".to_string())]
        );
        assert!(
            vault
                .host_events(&event(
                    EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)),
                    &vault,
                    &["a.md"]
                ))
                .is_empty()
        );
    }

    #[test]
    fn paired_rename_maps_to_rename() {
        let (_dir, vault) = vault_with(&["new.md"]);
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &vault,
            &["old.md", "new.md"],
        );
        assert_eq!(
            vault.host_events(&ev),
            vec![HostEvent::Rename {
                from: "old.md".to_string(),
                to: "new.md".to_string()
            }]
        );
    }

    #[test]
    fn rename_out_of_vault_scope_is_a_delete() {
        let (_dir, vault) = vault_with(&["gone.md"]);
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &vault,
            &["gone.md", ".obsidian/trash/gone.md"],
        );
        assert_eq!(vault.host_events(&ev), vec![HostEvent::Delete("gone.md".to_string())]);
    }

    #[test]
    fn remove_and_private_events() {
        let (_dir, vault) = vault_with(&[]);
        assert_eq!(
            vault.host_events(&event(EventKind::Remove(RemoveKind::File), &vault, &["x.md"])),
            vec![HostEvent::Delete("x.md".to_string())]
        );
        assert!(
            vault
                .host_events(&event(
                    EventKind::Create(CreateKind::File),
                    &vault,
                    &[".obsidian/vaultsync/index.json"]
                ))
                .is_empty()
        );
    }

    fn rename(from: &str, to: &str) -> HostEvent {
        HostEvent::Rename {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn deletes(paths: &[&str]) -> Vec<HostEvent> {
        paths.iter().map(|p| HostEvent::Delete(p.to_string())).collect()
    }

    #[test]
    fn folder_rename_carries_every_file() {
        let (_dir, vault) = vault_with(&["notes/a.md", "notes/sub/b.md", "other.md"]);
        fs::rename(vault.root().join("notes"), vault.root().join("archive")).unwrap();

        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &vault,
            &["notes", "archive"],
        );
        assert_eq!(
            vault.host_events(&ev),
            vec![
                rename("notes/a.md", "archive/a.md"),
                rename("notes/sub/b.md", "archive/sub/b.md"),
            ]
        );

        // Later events see the new layout.
        fs::remove_dir_all(vault.root().join("archive")).unwrap();
        let ev = event(EventKind::Remove(RemoveKind::Folder), &vault, &["archive"]);
        assert_eq!(
            vault.host_events(&ev),
            deletes(&["archive/a.md", "archive/sub/b.md"])
        );
    }

    #[test]
    fn folder_rename_halves_expand_to_files() {
        let (_dir, vault) = vault_with(&["notes/a.md", "notes/sub/b.md"]);
        fs::rename(vault.root().join("notes"), vault.root().join("archive")).unwrap();

        let from = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &vault,
            &["notes"],
        );
        assert_eq!(
            vault.host_events(&from),
            deletes(&["notes/a.md", "notes/sub/b.md"])
        );

        let to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &vault,
            &["archive"],
        );
        assert_eq!(
            vault.host_events(&to),
            vec![
                HostEvent::Create("archive/a.md".to_string()),
                HostEvent::Create("archive/sub/b.md".to_string()),
            ]
        );

        // The paired event that follows the halves does not forget anything twice.
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &vault,
            &["notes", "archive"],
        );
        assert_eq!(
            vault.host_events(&both),
            vec![
                HostEvent::Create("archive/a.md".to_string()),
                HostEvent::Create("archive/sub/b.md".to_string()),
            ]
        );
    }

    #[test]
    fn folder_moved_out_forgets_its_files() {
        let (_dir, vault) = vault_with(&["notes/a.md", "notes/sub/b.md", "keep.md"]);
        let outside = TempDir::new().unwrap();
        fs::rename(vault.root().join("notes"), outside.path().join("notes")).unwrap();

        let ev = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(vault.root().join("notes"))
            .add_path(outside.path().join("notes"));
        assert_eq!(
            vault.host_events(&ev),
            deletes(&["notes/a.md", "notes/sub/b.md"])
        );
    }

    #[test]
    fn empty_folder_moved_out_is_not_forgotten() {
        let (_dir, vault) = vault_with(&["keep.md"]);
        fs::create_dir(vault.root().join("empty")).unwrap();
        fs::remove_dir(vault.root().join("empty")).unwrap();

        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &vault,
            &["empty"],
        );
        assert!(vault.host_events(&ev).is_empty());
    }

    #[test]
    fn folder_moved_in_creates_its_files() {
        let (_dir, vault) = vault_with(&[]);
        let outside = TempDir::new().unwrap();
        fs::create_dir_all(outside.path().join("incoming/deep")).unwrap();
        fs::write(outside.path().join("incoming/x.md"), "x").unwrap();
        fs::write(outside.path().join("incoming/deep/y.md"), "y").unwrap();
        fs::rename(outside.path().join("incoming"), vault.root().join("incoming")).unwrap();

        let expected = vec![
            HostEvent::Create("incoming/deep/y.md".to_string()),
            HostEvent::Create("incoming/x.md".to_string()),
        ];
        let paired = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(outside.path().join("incoming"))
            .add_path(vault.root().join("incoming"));
        assert_eq!(vault.host_events(&paired), expected);

        let created = event(EventKind::Create(CreateKind::Folder), &vault, &["incoming"]);
        assert_eq!(vault.host_events(&created), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn folder_rename_reduces_to_delete_and_update_per_file() {
        let (_dir, vault) = vault_with(&["notes/a.md"]);
        fs::rename(vault.root().join("notes"), vault.root().join("archive")).unwrap();
        let (tracker, mut batches, task) = ChangeTracker::spawn(std::time::Duration::from_secs(5));

        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &vault,
            &["notes", "archive"],
        );
        for host_event in vault.host_events(&ev) {
            tracker.handle(host_event);
        }
        drop(tracker);
        task.await.unwrap();

        let set = crate::coalescer::reduce(batches.recv().await.unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set["notes/a.md"], crate::change::ChangeKind::Delete);
        assert_eq!(set["archive/a.md"], crate::change::ChangeKind::Update);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_replay_creates_present_and_deletes_missing() {
        let (_dir, vault) = vault_with(&["a.md", "b.md"]);
        let (tracker, mut batches, task) = ChangeTracker::spawn(std::time::Duration::from_secs(5));

        let indexed = vec!["a.md".to_string(), "stale.md".to_string()];
        assert_eq!(vault.replay_startup(&tracker, &indexed), 3);
        drop(tracker);
        task.await.unwrap();

        assert_eq!(
            batches.recv().await.unwrap(),
            vec![
                Change::update("a.md"),
                Change::update("b.md"),
                Change::delete("stale.md"),
            ]
        );
    }
}
