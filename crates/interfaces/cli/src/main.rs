use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vaultsync_config::AppConfig;
use vaultsync_index::{FsStorage, IndexStore};
use vaultsync_runtime::{build_client, run_watch};

#[derive(Debug, Parser)]
#[command(
    name = "vaultsync",
    version,
    about = "Mirror a notes vault into a remote indexing service"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch the vault and sync changes until interrupted (default).
    Watch,
    /// Show the vault, index and session state.
    Status,
    /// Exchange the API key for a new session and store it.
    Auth,
    /// Replace the API key.  Clears the stored session.
    SetKey {
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Drop the stored session identifier.
    ForgetSession,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => watch(config, &cli.config).await?,
        Commands::Status => status(&config).await?,
        Commands::Auth => {
            if config.remote.api_key.trim().is_empty() {
                bail!("no API key configured; run `vaultsync set-key <KEY>` or set VAULTSYNC_API_KEY");
            }
            let mut client = build_client(&config)?;
            let session = client
                .authenticate_now(&config.remote.api_key)
                .await
                .context("authenticating with the remote service")?;
            store_session_id(&cli.config, session.as_str())?;
            println!("session stored in {}", cli.config.display());
        }
        Commands::SetKey { key } => {
            AppConfig::edit_file(&cli.config, |c| c.set_api_key(key.trim()))?;
            println!("API key updated; stored session cleared");
        }
        Commands::ForgetSession => {
            AppConfig::edit_file(&cli.config, AppConfig::clear_session)?;
            println!("stored session cleared");
        }
    }

    Ok(())
}

async fn watch(mut config: AppConfig, config_path: &Path) -> Result<()> {
    let mut client = build_client(&config)?;

    let stored = config.stored_session_id().map(str::to_string);
    match client
        .authenticate(&config.remote.api_key, stored.as_deref())
        .await
    {
        Ok(Some(session)) => {
            config.remote.session_id = session.as_str().to_string();
            store_session_id(config_path, session.as_str())?;
        }
        Ok(None) => info!("no stored session; syncing without one"),
        // Sync still runs; the service rejects calls until a session exists.
        Err(err) => warn!(%err, "remote auth failed"),
    }

    let service = run_watch(&config, client, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    println!("stopped; {} paths indexed", service.index().len());
    Ok(())
}

/// Persist a newly issued session id.  Only that field of the file changes.
fn store_session_id(config_path: &Path, session_id: &str) -> Result<()> {
    AppConfig::edit_file(config_path, |c| c.remote.session_id = session_id.to_string())
        .with_context(|| format!("storing session id in {}", config_path.display()))
}

async fn status(config: &AppConfig) -> Result<()> {
    let index = IndexStore::load(Arc::new(FsStorage), config.index_path(), config.commit_delay())
        .await
        .context("loading file index")?;

    println!("vault:    {}", config.vault_root().display());
    println!("index:    {} ({} paths)", index.path().display(), index.len());
    println!("remote:   {}", config.remote.host);
    println!(
        "api key:  {}",
        if config.remote.api_key.trim().is_empty() { "missing" } else { "set" }
    );
    println!(
        "session:  {}",
        if config.stored_session_id().is_some() { "stored" } else { "none" }
    );
    println!("debounce: {} ms", config.sync.debounce_ms);
    Ok(())
}
