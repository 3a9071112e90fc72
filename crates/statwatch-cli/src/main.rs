use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use statwatch_core::NewAccount;
use statwatch_sync::{
    shutdown_channel, wait_for_os_signal, IngestionScheduler, StorageConfig, TrackerConfig,
};
use statwatch_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "statwatch")]
#[command(about = "Record tracker profile statistics over time")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the background fetcher and the HTTP API (default).
    Serve,
    /// Fetch every account once and exit.
    Sync,
    /// Register an account given as "DisplayName,RemoteID".
    AddAccount { spec: String },
    /// Load a legacy JSON export into the store.
    Import {
        #[arg(long)]
        profiles: PathBuf,
        #[arg(long)]
        history: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_files = statwatch_sync::load_env_files(Path::new("."));
    init_logging();
    for path in &env_files {
        info!(path = %path.display(), "loaded environment file");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Sync => {
            let config = TrackerConfig::from_env()?;
            let summary = statwatch_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: accounts={} appended={} fetch_failures={} store_failures={}",
                summary.accounts, summary.appended, summary.fetch_failures, summary.store_failures
            );
        }
        Commands::AddAccount { spec } => {
            let account = NewAccount::parse(&spec)?;
            let store = StorageConfig::from_env().open_store().await?;
            let added = store.accounts().add(&account).await?;
            println!(
                "added account {} (remote id {}) as #{}",
                added.display_name, added.remote_id, added.id
            );
        }
        Commands::Import { profiles, history } => {
            let (accounts, snapshots) =
                statwatch_sync::load_legacy_export(&profiles, &history).await?;
            let store = StorageConfig::from_env().open_store().await?;
            let summary = store.import_legacy(&accounts, &snapshots).await?;
            println!(
                "import complete: accounts={} snapshots={} skipped={}",
                summary.accounts, summary.snapshots, summary.skipped
            );
        }
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(statwatch_sync::log_level_from_env())
            }),
        )
        .init();
}

async fn serve() -> Result<()> {
    let config = TrackerConfig::from_env()?;
    let store = config.storage.open_store().await?;
    let scheduler = IngestionScheduler::from_config(store.clone(), &config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.server_port))
        .await
        .with_context(|| format!("binding port {}", config.server_port))?;

    let (trigger, shutdown) = shutdown_channel();
    let fetcher = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });
    let mut server = tokio::spawn(statwatch_web::serve(
        listener,
        AppState::new(store, config.web_root.clone()),
        shutdown,
    ));

    let server_result = tokio::select! {
        _ = wait_for_os_signal() => {
            info!("shutdown signal received");
            None
        }
        result = &mut server => Some(result),
    };
    trigger.trigger();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let server_result = match server_result {
            Some(result) => result,
            None => server.await,
        };
        let _ = fetcher.await;
        server_result
    })
    .await;

    match drained {
        Ok(result) => result.context("server task panicked")??,
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "shutdown grace period elapsed; exiting anyway"
        ),
    }
    info!("server exiting");
    Ok(())
}
