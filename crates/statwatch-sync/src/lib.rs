//! Ingestion scheduling: configuration, the fetch cycle, and cooperative shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use statwatch_adapters::{
    parse_profile_page, FetchError, ProfileSource, SourceClient, SourceClientConfig,
    DEFAULT_BASE_URL,
};
use statwatch_core::{Account, Credentials, NewAccount, ProfileSnapshot};
use statwatch_storage::{PageArchive, SnapshotStore, StorageError};
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "statwatch-sync";

const DEFAULT_SERVER_PORT: u16 = 3000;
const DEFAULT_FETCH_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FETCH_PAUSE_MS: u64 = 2_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    non_empty(lookup, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `LOG_LEVEL` mapped onto a tracing filter directive; unknown values mean `info`.
pub fn log_level_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> &'static str {
    match lookup("LOG_LEVEL")
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("debug") => "debug",
        Some("warn") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

pub fn log_level_from_env() -> &'static str {
    log_level_from_lookup(|key| std::env::var(key).ok())
}

/// Load `.env.local`, then `.env`, from `dir`. Variables already set are never
/// overridden, so the process environment wins over `.env.local` over `.env`.
/// Returns the files that were read.
pub fn load_env_files(dir: &Path) -> Vec<PathBuf> {
    let mut loaded = Vec::new();
    for name in [".env.local", ".env"] {
        let path = dir.join(name);
        match dotenvy::from_path(&path) {
            Ok(()) => loaded.push(path),
            Err(err) if err.not_found() => {}
            Err(err) => warn!(path = %path.display(), error = %err, "could not load environment file"),
        }
    }
    loaded
}

/// Settings needed to open the store. Carries no secrets.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_dir: PathBuf,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_dir: non_empty(&lookup, "DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
        }
    }

    pub async fn open_store(&self) -> Result<SnapshotStore> {
        SnapshotStore::open_in_dir(&self.database_dir)
            .await
            .with_context(|| format!("opening snapshot store in {}", self.database_dir.display()))
    }
}

/// Full runtime configuration for the commands that fetch from the source.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub credentials: Credentials,
    pub server_port: u16,
    pub storage: StorageConfig,
    pub fetch_interval: Duration,
    pub fetch_pause: Duration,
    pub http_timeout: Duration,
    pub source_base_url: String,
    pub user_agent: String,
    pub web_root: PathBuf,
    pub raw_archive_dir: Option<PathBuf>,
}

impl TrackerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Fails fast when either half of the credential pair is absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let nick = non_empty(&lookup, "NICK").ok_or(ConfigError::MissingVar("NICK"))?;
        let pass = non_empty(&lookup, "PASS").ok_or(ConfigError::MissingVar("PASS"))?;

        let server_port = non_empty(&lookup, "SERVER_PORT")
            .and_then(|v| v.trim().trim_start_matches(':').parse().ok())
            .unwrap_or(DEFAULT_SERVER_PORT);

        Ok(Self {
            credentials: Credentials::new(nick, pass),
            server_port,
            storage: StorageConfig::from_lookup(&lookup),
            fetch_interval: Duration::from_secs(parsed_or(
                &lookup,
                "FETCH_INTERVAL_SECS",
                DEFAULT_FETCH_INTERVAL_SECS,
            )),
            fetch_pause: Duration::from_millis(parsed_or(
                &lookup,
                "FETCH_PAUSE_MS",
                DEFAULT_FETCH_PAUSE_MS,
            )),
            http_timeout: Duration::from_secs(parsed_or(
                &lookup,
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            source_base_url: non_empty(&lookup, "SOURCE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            user_agent: non_empty(&lookup, "USER_AGENT")
                .unwrap_or_else(|| "statwatch/0.1".to_string()),
            web_root: non_empty(&lookup, "WEB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./web")),
            raw_archive_dir: non_empty(&lookup, "RAW_ARCHIVE_DIR").map(PathBuf::from),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.fetch_interval,
            pause_between_accounts: self.fetch_pause,
        }
    }

    pub fn source_client(&self) -> Result<SourceClient> {
        SourceClient::new(
            SourceClientConfig {
                base_url: self.source_base_url.clone(),
                timeout: self.http_timeout,
                user_agent: Some(self.user_agent.clone()),
            },
            self.credentials.clone(),
        )
        .context("building source client")
    }
}

/// Receiving half of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending half; dropping every trigger also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    /// True once triggered, or once every trigger is gone.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub pause_between_accounts: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_FETCH_INTERVAL_SECS),
            pause_between_accounts: Duration::from_millis(DEFAULT_FETCH_PAUSE_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub accounts: usize,
    pub appended: usize,
    pub fetch_failures: usize,
    pub store_failures: usize,
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StorageError),
}

/// Single writer: fetches every account in turn and appends what it extracts.
pub struct IngestionScheduler {
    store: SnapshotStore,
    source: Arc<dyn ProfileSource>,
    archive: Option<PageArchive>,
    config: SchedulerConfig,
}

impl IngestionScheduler {
    pub fn new(store: SnapshotStore, source: Arc<dyn ProfileSource>, config: SchedulerConfig) -> Self {
        Self {
            store,
            source,
            archive: None,
            config,
        }
    }

    pub fn from_config(store: SnapshotStore, config: &TrackerConfig) -> Result<Self> {
        let source = Arc::new(config.source_client()?);
        let scheduler = Self::new(store, source, config.scheduler_config());
        Ok(match &config.raw_archive_dir {
            Some(dir) => scheduler.with_archive(PageArchive::new(dir)),
            None => scheduler,
        })
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// One cycle immediately, then one per interval until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(interval_secs = self.config.interval.as_secs(), "starting background profile fetcher");
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.run_cycle(&shutdown).await.cancelled {
                break;
            }
        }
        info!("stopping background profile fetcher");
    }

    /// Fetch every known account once. Per-account failures are logged and counted;
    /// they never stop the rest of the cycle.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let accounts = match self.store.accounts().list().await {
            Ok(accounts) => accounts,
            Err(err) => {
                error!(error = %err, "could not list accounts to fetch");
                return summary;
            }
        };
        if accounts.is_empty() {
            info!("no accounts to fetch; add one with `statwatch add-account \"Name,RemoteID\"`");
            return summary;
        }

        summary.accounts = accounts.len();
        info!(accounts = accounts.len(), "starting profile fetch cycle");

        for (idx, account) in accounts.iter().enumerate() {
            if shutdown.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self.ingest_account(account).await {
                Ok(_) => summary.appended += 1,
                Err(IngestError::Fetch(err)) => {
                    summary.fetch_failures += 1;
                    error!(account = %account.display_name, error = %err, "error fetching profile");
                }
                Err(IngestError::Store(err)) => {
                    summary.store_failures += 1;
                    error!(account = %account.display_name, error = %err, "error recording profile snapshot");
                }
            }

            let last = idx + 1 == accounts.len();
            if !last && !self.config.pause_between_accounts.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.pause_between_accounts) => {}
                }
            }
        }

        info!(
            appended = summary.appended,
            fetch_failures = summary.fetch_failures,
            store_failures = summary.store_failures,
            cancelled = summary.cancelled,
            "profile fetch cycle complete"
        );
        summary
    }

    pub async fn ingest_account(&self, account: &Account) -> Result<ProfileSnapshot, IngestError> {
        let page = self.source.fetch(account).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .archive_page(page.fetched_at, &account.remote_id, page.body.as_bytes())
                .await
            {
                warn!(account = %account.display_name, error = %format!("{err:#}"), "could not archive profile page");
            }
        }

        let snapshot = parse_profile_page(&page.body, &account.display_name, page.fetched_at);
        self.store.append(&snapshot, account.id).await?;
        info!(
            account = %account.display_name,
            rank = snapshot.rank,
            points = snapshot.points,
            "profile snapshot recorded"
        );
        Ok(snapshot)
    }
}

/// Run exactly one cycle with the given configuration.
pub async fn run_sync_once(config: &TrackerConfig) -> Result<CycleSummary> {
    let store = config.storage.open_store().await?;
    let scheduler = IngestionScheduler::from_config(store, config)?;
    let (_trigger, shutdown) = shutdown_channel();
    Ok(scheduler.run_cycle(&shutdown).await)
}

/// Read the legacy JSON export: a `name -> remote id` object plus a snapshot array.
pub async fn load_legacy_export(
    profiles_path: &Path,
    history_path: &Path,
) -> Result<(Vec<NewAccount>, Vec<ProfileSnapshot>)> {
    let profiles_text = fs::read_to_string(profiles_path)
        .await
        .with_context(|| format!("reading {}", profiles_path.display()))?;
    let profiles: BTreeMap<String, String> = serde_json::from_str(&profiles_text)
        .with_context(|| format!("parsing {}", profiles_path.display()))?;

    let history_text = fs::read_to_string(history_path)
        .await
        .with_context(|| format!("reading {}", history_path.display()))?;
    let history: Vec<ProfileSnapshot> = serde_json::from_str(&history_text)
        .with_context(|| format!("parsing {}", history_path.display()))?;

    let accounts = profiles
        .into_iter()
        .map(|(display_name, remote_id)| NewAccount::new(display_name, remote_id))
        .collect();
    Ok((accounts, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use sqlx::SqlitePool;
    use statwatch_adapters::{FetchedPage, StatusCode};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    fn page(rank: &str, points: &str) -> String {
        format!(
            "<div class=\"userbox_tartalom_mini\">\
             <div class=\"profil_jobb_elso2\">Helyezés:</div><div>{rank}</div>\
             <div class=\"profil_jobb_elso2\">Pontok száma:</div><div>{points}</div>\
             </div>"
        )
    }

    /// Serves canned pages keyed by remote id; advances a fake clock per fetch.
    struct FakeSource {
        pages: Mutex<HashMap<String, String>>,
        clock: Mutex<DateTime<Utc>>,
        fetched: Mutex<Vec<String>>,
        on_fetch: Box<dyn Fn(&Account) + Send + Sync>,
        delete_on_fetch: Option<(String, SqlitePool)>,
    }

    impl FakeSource {
        fn new(pages: &[(&str, String)]) -> Self {
            Self {
                pages: Mutex::new(
                    pages
                        .iter()
                        .map(|(id, body)| (id.to_string(), body.clone()))
                        .collect(),
                ),
                clock: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()),
                fetched: Mutex::new(Vec::new()),
                on_fetch: Box::new(|_| {}),
                delete_on_fetch: None,
            }
        }

        fn with_hook(mut self, hook: impl Fn(&Account) + Send + Sync + 'static) -> Self {
            self.on_fetch = Box::new(hook);
            self
        }

        fn deleting_on_fetch(mut self, display_name: &str, pool: SqlitePool) -> Self {
            self.delete_on_fetch = Some((display_name.to_string(), pool));
            self
        }

        fn set_page(&self, remote_id: &str, body: String) {
            self.pages.lock().unwrap().insert(remote_id.to_string(), body);
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProfileSource for FakeSource {
        async fn fetch(&self, account: &Account) -> Result<FetchedPage, FetchError> {
            self.fetched.lock().unwrap().push(account.display_name.clone());
            (self.on_fetch)(account);
            if let Some((name, pool)) = &self.delete_on_fetch {
                if *name == account.display_name {
                    sqlx::query("DELETE FROM accounts WHERE id = ?")
                        .bind(account.id)
                        .execute(pool)
                        .await
                        .unwrap();
                }
            }
            let fetched_at = {
                let mut clock = self.clock.lock().unwrap();
                *clock += ChronoDuration::minutes(1);
                *clock
            };
            match self.pages.lock().unwrap().get(&account.remote_id) {
                Some(body) => Ok(FetchedPage {
                    url: format!("fake://{}", account.remote_id),
                    status: StatusCode::OK,
                    body: body.clone(),
                    fetched_at,
                }),
                None => Err(FetchError::HttpStatus {
                    display_name: account.display_name.clone(),
                    status: 500,
                    url: format!("fake://{}", account.remote_id),
                }),
            }
        }
    }

    fn no_pause() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            pause_between_accounts: Duration::ZERO,
        }
    }

    async fn store_with(names: &[(&str, &str)]) -> SnapshotStore {
        let store = SnapshotStore::in_memory().await.unwrap();
        for (name, remote_id) in names {
            store
                .accounts()
                .add(&NewAccount::new(*name, *remote_id))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn config_requires_both_credentials() {
        assert_eq!(
            TrackerConfig::from_lookup(lookup(&[("PASS", "p")])).unwrap_err(),
            ConfigError::MissingVar("NICK")
        );
        assert_eq!(
            TrackerConfig::from_lookup(lookup(&[("NICK", "n"), ("PASS", "  ")])).unwrap_err(),
            ConfigError::MissingVar("PASS")
        );
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = TrackerConfig::from_lookup(lookup(&[("NICK", "n"), ("PASS", "p")])).unwrap();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.storage.database_dir, PathBuf::from("./data"));
        assert_eq!(config.fetch_interval, Duration::from_secs(86_400));
        assert_eq!(config.fetch_pause, Duration::from_millis(2_000));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.source_base_url, DEFAULT_BASE_URL);
        assert!(config.raw_archive_dir.is_none());

        let config = TrackerConfig::from_lookup(lookup(&[
            ("NICK", "n"),
            ("PASS", "p"),
            ("SERVER_PORT", ":8080"),
            ("DATABASE_PATH", "/var/lib/statwatch"),
            ("FETCH_INTERVAL_SECS", "60"),
            ("FETCH_PAUSE_MS", "not-a-number"),
            ("RAW_ARCHIVE_DIR", "/tmp/pages"),
        ]))
        .unwrap();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.storage.database_dir, PathBuf::from("/var/lib/statwatch"));
        assert_eq!(config.fetch_interval, Duration::from_secs(60));
        assert_eq!(config.fetch_pause, Duration::from_millis(2_000));
        assert_eq!(config.raw_archive_dir, Some(PathBuf::from("/tmp/pages")));
    }

    #[test]
    fn env_files_never_override_existing_variables() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env.local"),
            "STATWATCH_ENVTEST_SET=local\nSTATWATCH_ENVTEST_BOTH=local\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "STATWATCH_ENVTEST_BOTH=shared\nSTATWATCH_ENVTEST_SHARED=shared\n",
        )
        .unwrap();
        std::env::set_var("STATWATCH_ENVTEST_SET", "process");

        let loaded = load_env_files(dir.path());

        assert_eq!(loaded, vec![dir.path().join(".env.local"), dir.path().join(".env")]);
        assert_eq!(std::env::var("STATWATCH_ENVTEST_SET").unwrap(), "process");
        assert_eq!(std::env::var("STATWATCH_ENVTEST_BOTH").unwrap(), "local");
        assert_eq!(std::env::var("STATWATCH_ENVTEST_SHARED").unwrap(), "shared");
    }

    #[test]
    fn missing_env_files_are_skipped() {
        let dir = tempdir().unwrap();
        assert!(load_env_files(dir.path()).is_empty());
    }

    #[test]
    fn log_level_maps_known_values() {
        assert_eq!(log_level_from_lookup(lookup(&[("LOG_LEVEL", "DEBUG")])), "debug");
        assert_eq!(log_level_from_lookup(lookup(&[("LOG_LEVEL", "warn")])), "warn");
        assert_eq!(log_level_from_lookup(lookup(&[("LOG_LEVEL", "verbose")])), "info");
        assert_eq!(log_level_from_lookup(lookup(&[])), "info");
    }

    #[tokio::test]
    async fn empty_registry_cycle_is_a_no_op() {
        let store = store_with(&[]).await;
        let source = Arc::new(FakeSource::new(&[]));
        let scheduler = IngestionScheduler::new(store, source.clone(), no_pause());
        let (_trigger, shutdown) = shutdown_channel();

        assert_eq!(scheduler.run_cycle(&shutdown).await, CycleSummary::default());
        assert!(source.fetched().is_empty());
    }

    #[tokio::test]
    async fn consecutive_cycles_grow_history_and_move_latest() {
        let store = store_with(&[("Alice", "1")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("5.", "1000"))]));
        let scheduler = IngestionScheduler::new(store.clone(), source.clone(), no_pause());
        let (_trigger, shutdown) = shutdown_channel();

        assert!(store.latest_per_account().await.unwrap().is_empty());

        let summary = scheduler.run_cycle(&shutdown).await;
        assert_eq!(summary.appended, 1);
        let latest = store.latest_per_account().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!((latest[0].owner.as_str(), latest[0].rank, latest[0].points), ("Alice", 5, 1000));

        source.set_page("1", page("4.", "1 250"));
        scheduler.run_cycle(&shutdown).await;
        let latest = store.latest_per_account().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!((latest[0].rank, latest[0].points), (4, 1250));

        let history = store.history_for("Alice").await.unwrap();
        assert_eq!(history.iter().map(|s| s.points).collect::<Vec<_>>(), vec![1000, 1250]);
        assert!(history[0].timestamp < history[1].timestamp);
    }

    #[tokio::test]
    async fn fetch_failure_does_not_block_other_accounts() {
        let store = store_with(&[("Alice", "1"), ("Bob", "2"), ("Carol", "3")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("1.", "10")), ("3", page("3.", "30"))]));
        let scheduler = IngestionScheduler::new(store.clone(), source.clone(), no_pause());
        let (_trigger, shutdown) = shutdown_channel();

        let summary = scheduler.run_cycle(&shutdown).await;
        assert_eq!(
            summary,
            CycleSummary {
                accounts: 3,
                appended: 2,
                fetch_failures: 1,
                store_failures: 0,
                cancelled: false
            }
        );
        assert_eq!(source.fetched(), vec!["Alice", "Bob", "Carol"]);
        let owners = store
            .latest_per_account()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.owner)
            .collect::<Vec<_>>();
        assert_eq!(owners, vec!["Alice", "Carol"]);
        assert!(store.history_for("Bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_counted_and_cycle_continues() {
        let store = store_with(&[("Alice", "1"), ("Bob", "2")]).await;
        // Alice disappears while her fetch is in flight, so the append trips the foreign key.
        let source = FakeSource::new(&[("1", page("1.", "10")), ("2", page("2.", "20"))])
            .deleting_on_fetch("Alice", store.pool().clone());
        let scheduler = IngestionScheduler::new(store.clone(), Arc::new(source), no_pause());
        let (_trigger, shutdown) = shutdown_channel();

        let summary = scheduler.run_cycle(&shutdown).await;
        assert_eq!(summary.store_failures, 1);
        assert_eq!(summary.appended, 1);
        assert_eq!(store.history_for("Bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_between_accounts_stops_the_cycle() {
        let store = store_with(&[("Alice", "1"), ("Bob", "2")]).await;
        let (trigger, shutdown) = shutdown_channel();
        let trigger = Arc::new(trigger);
        let hook_trigger = trigger.clone();
        let source = Arc::new(
            FakeSource::new(&[("1", page("1.", "10")), ("2", page("2.", "20"))]).with_hook(
                move |account| {
                    if account.display_name == "Alice" {
                        hook_trigger.trigger();
                    }
                },
            ),
        );
        let scheduler = IngestionScheduler::new(store.clone(), source.clone(), no_pause());

        let summary = scheduler.run_cycle(&shutdown).await;
        assert!(summary.cancelled);
        // The in-flight fetch for Alice completes and is recorded; Bob is never fetched.
        assert_eq!(summary.appended, 1);
        assert_eq!(source.fetched(), vec!["Alice"]);
        assert!(store.history_for("Bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_inter_account_pause() {
        let store = store_with(&[("Alice", "1"), ("Bob", "2")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("1.", "10")), ("2", page("2.", "20"))]));
        let scheduler = IngestionScheduler::new(
            store,
            source.clone(),
            SchedulerConfig {
                interval: Duration::from_secs(3600),
                pause_between_accounts: Duration::from_secs(60),
            },
        );
        let (trigger, shutdown) = shutdown_channel();

        let cycle = tokio::spawn(async move { scheduler.run_cycle(&shutdown).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();

        let summary = tokio::time::timeout(Duration::from_secs(2), cycle)
            .await
            .expect("cycle stops promptly")
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(source.fetched(), vec!["Alice"]);
    }

    #[tokio::test]
    async fn run_fetches_immediately_and_exits_on_shutdown() {
        let store = store_with(&[("Alice", "1")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("5.", "1000"))]));
        let scheduler = IngestionScheduler::new(store.clone(), source.clone(), no_pause());
        let (trigger, shutdown) = shutdown_channel();

        let task = tokio::spawn(async move { scheduler.run(shutdown).await });

        let mut recorded = false;
        for _ in 0..100 {
            if !store.history_for("Alice").await.unwrap().is_empty() {
                recorded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(recorded, "first cycle runs without waiting for the interval");

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("scheduler exits while sleeping on the interval")
            .unwrap();
        assert_eq!(source.fetched().len(), 1);
    }

    #[tokio::test]
    async fn cycle_without_a_live_trigger_fetches_nothing() {
        let store = store_with(&[("Alice", "1"), ("Bob", "2")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("1.", "10")), ("2", page("2.", "20"))]));
        let scheduler = IngestionScheduler::new(store, source.clone(), no_pause());
        let (trigger, shutdown) = shutdown_channel();
        drop(trigger);

        let summary = scheduler.run_cycle(&shutdown).await;
        assert!(summary.cancelled);
        assert_eq!(summary.appended, 0);
        assert!(source.fetched().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_trigger_counts_as_shutdown() {
        let (trigger, shutdown) = shutdown_channel();
        assert!(!shutdown.is_cancelled());
        drop(trigger);
        assert!(shutdown.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("cancelled resolves");
    }

    #[tokio::test]
    async fn archive_receives_fetched_pages() {
        let dir = tempdir().unwrap();
        let store = store_with(&[("Alice", "1")]).await;
        let source = Arc::new(FakeSource::new(&[("1", page("5.", "1000"))]));
        let scheduler = IngestionScheduler::new(store, source, no_pause())
            .with_archive(PageArchive::new(dir.path()));
        let (_trigger, shutdown) = shutdown_channel();

        scheduler.run_cycle(&shutdown).await;

        let day_dirs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(day_dirs, 1);
    }

    #[tokio::test]
    async fn legacy_export_loads_profiles_and_history() {
        let dir = tempdir().unwrap();
        let profiles = dir.path().join("profiles.json");
        let history = dir.path().join("data.json");
        std::fs::write(&profiles, r#"{"Bob": "2", "Alice": "1"}"#).unwrap();
        std::fs::write(
            &history,
            r#"[{"owner":"Alice","timestamp":"2025-05-01T10:00:00.123456789+02:00","rank":5,
                 "upload":"1 TiB","current_upload":"2 GiB","current_download":"3 GiB",
                 "points":1000,"seeding_count":12}]"#,
        )
        .unwrap();

        let (accounts, snapshots) = load_legacy_export(&profiles, &history).await.unwrap();
        assert_eq!(
            accounts,
            vec![NewAccount::new("Alice", "1"), NewAccount::new("Bob", "2")]
        );
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0].timestamp,
            Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).single().unwrap()
                + ChronoDuration::nanoseconds(123_456_789)
        );
    }
}
