use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Vault ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the observed file tree.
    pub path: String,
    /// Host configuration directory inside the vault.  Everything below it is
    /// private to the host and never synchronised.
    pub config_dir: String,
    /// Directory name under `config_dir` that holds this tool's private state.
    pub plugin_id: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            config_dir: ".obsidian".to_string(),
            plugin_id: "vaultsync".to_string(),
        }
    }
}

// ── Remote service ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the indexing service.  Not exposed through any interactive
    /// settings; override with `VAULTSYNC_REMOTE_HOST`.
    pub host: String,
    /// Client credential exchanged for a session.  `VAULTSYNC_API_KEY` takes
    /// precedence when set.
    pub api_key: String,
    /// Session identifier persisted after a successful auth exchange.
    /// Empty means "no stored session".
    pub session_id: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8000".to_string(),
            api_key: String::new(),
            session_id: String::new(),
        }
    }
}

// ── Sync pipeline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet time after the last file event before a batch is flushed.
    pub debounce_ms: u64,
    /// Quiet time after the last index mutation before the index is written.
    pub commit_delay_ms: u64,
    /// File extensions (without the dot, case-insensitive) whose content is
    /// sent to the remote learn endpoint.  Other files are tracked in the
    /// local index only.
    pub extensions: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 5_000,
            commit_delay_ms: 2_000,
            extensions: vec!["md".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load_file(path)?;

        if let Ok(key) = env::var("VAULTSYNC_API_KEY") {
            if !key.is_empty() {
                config.remote.api_key = key;
            }
        }

        if let Ok(host) = env::var("VAULTSYNC_REMOTE_HOST") {
            if !host.is_empty() {
                config.remote.host = host;
            }
        }

        Ok(config)
    }

    /// The file as written, without environment overrides.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Apply `edit` to the file at `path` and write it back.  Values that
    /// only came from the environment stay out of the file.
    pub fn edit_file(path: impl AsRef<Path>, edit: impl FnOnce(&mut Self)) -> Result<()> {
        let path = path.as_ref();
        let mut on_disk = Self::load_file(path)?;
        edit(&mut on_disk);
        on_disk.save_to(path)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn vault_root(&self) -> PathBuf {
        PathBuf::from(&self.vault.path)
    }

    /// Directory holding this tool's private state inside the vault.
    pub fn state_dir(&self) -> PathBuf {
        self.vault_root()
            .join(&self.vault.config_dir)
            .join(&self.vault.plugin_id)
    }

    /// Location of the persisted file index.
    pub fn index_path(&self) -> PathBuf {
        self.state_dir().join("index.json")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.sync.debounce_ms)
    }

    pub fn commit_delay(&self) -> Duration {
        Duration::from_millis(self.sync.commit_delay_ms)
    }

    /// The stored session identifier, if one has been persisted.
    pub fn stored_session_id(&self) -> Option<&str> {
        let id = self.remote.session_id.trim();
        (!id.is_empty()).then_some(id)
    }

    /// Replacing the credential invalidates any stored session.
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        self.remote.api_key = key.into();
        self.remote.session_id.clear();
    }

    pub fn clear_session(&mut self) {
        self.remote.session_id.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
