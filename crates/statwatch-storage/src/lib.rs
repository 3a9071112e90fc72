//! Append-only snapshot persistence (SQLite) + raw page archive for statwatch.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use statwatch_core::{Account, AccountId, NewAccount, ProfileSnapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statwatch-storage";

pub const DATABASE_FILE_NAME: &str = "stats.db";

const CREATE_ACCOUNTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id           INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    display_name TEXT    NOT NULL UNIQUE,
    remote_id    TEXT    NOT NULL
)
"#;

const CREATE_SNAPSHOTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id               INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id       INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    observed_at      TEXT    NOT NULL,
    rank             INTEGER NOT NULL,
    upload           TEXT    NOT NULL,
    current_upload   TEXT    NOT NULL,
    current_download TEXT    NOT NULL,
    points           INTEGER NOT NULL,
    seeding_count    INTEGER NOT NULL
)
"#;

const CREATE_SNAPSHOTS_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS snapshots_account_observed
    ON snapshots (account_id, observed_at, id)
"#;

/// One pass over `snapshots`, ranking each account's rows newest first.
const LATEST_PER_ACCOUNT_SQL: &str = r#"
SELECT a.display_name, s.observed_at, s.rank, s.upload, s.current_upload,
       s.current_download, s.points, s.seeding_count
  FROM (
        SELECT snapshots.*,
               ROW_NUMBER() OVER (
                   PARTITION BY account_id
                   ORDER BY observed_at DESC, id DESC
               ) AS recency
          FROM snapshots
       ) s
  JOIN accounts a ON a.id = s.account_id
 WHERE s.recency = 1
 ORDER BY a.display_name
"#;

const INSERT_SNAPSHOT_SQL: &str = r#"
INSERT INTO snapshots
       (account_id, observed_at, rank, upload, current_upload, current_download, points, seeding_count)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_ACCOUNT_SQL: &str = "INSERT INTO accounts (display_name, remote_id) VALUES (?, ?)";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("account {display_name:?} already exists")]
    Conflict { display_name: String },
    #[error("no account with id {0}")]
    UnknownAccount(AccountId),
    #[error("stored timestamp {value:?} is not RFC 3339: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("creating database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    fn from_account_insert(err: sqlx::Error, display_name: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict {
                display_name: display_name.to_string(),
            },
            _ => Self::Database(err),
        }
    }

    fn from_snapshot_insert(err: sqlx::Error, account_id: AccountId) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Self::UnknownAccount(account_id)
            }
            _ => Self::Database(err),
        }
    }
}

/// Fixed-width UTC text so that lexical order in SQLite equals chronological order.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| StorageError::Timestamp {
            value: value.to_string(),
            source,
        })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<ProfileSnapshot, StorageError> {
    let observed_at: String = row.try_get("observed_at")?;
    Ok(ProfileSnapshot {
        owner: row.try_get("display_name")?,
        timestamp: decode_timestamp(&observed_at)?,
        rank: row.try_get("rank")?,
        upload: row.try_get("upload")?,
        current_upload: row.try_get("current_upload")?,
        current_download: row.try_get("current_download")?,
        points: row.try_get("points")?,
        seeding_count: row.try_get("seeding_count")?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StorageError> {
    Ok(Account {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        remote_id: row.try_get("remote_id")?,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub accounts: usize,
    pub snapshots: usize,
    pub skipped: usize,
}

/// Append-only store of accounts and their snapshot history.
///
/// The "latest" view is always derived from the history on read; there is no
/// separately maintained current-state table.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Open (creating if needed) `<dir>/stats.db`.
    pub async fn open_in_dir(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open(dir.as_ref().join(DATABASE_FILE_NAME)).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(path = %path.display(), "snapshot store opened");
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn accounts(&self) -> AccountRegistry {
        AccountRegistry {
            pool: self.pool.clone(),
        }
    }

    /// Idempotent: safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_ACCOUNTS_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_SNAPSHOTS_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_SNAPSHOTS_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert one immutable snapshot row. Never updates.
    pub async fn append(
        &self,
        snapshot: &ProfileSnapshot,
        account_id: AccountId,
    ) -> Result<i64, StorageError> {
        let result = sqlx::query(INSERT_SNAPSHOT_SQL)
            .bind(account_id)
            .bind(encode_timestamp(snapshot.timestamp))
            .bind(snapshot.rank)
            .bind(&snapshot.upload)
            .bind(&snapshot.current_upload)
            .bind(&snapshot.current_download)
            .bind(snapshot.points)
            .bind(snapshot.seeding_count)
            .execute(&self.pool)
            .await
            .map_err(|err| StorageError::from_snapshot_insert(err, account_id))?;
        Ok(result.last_insert_rowid())
    }

    /// Exactly one snapshot per account that has any: the one with the greatest
    /// timestamp, ties going to the most recently inserted row.
    pub async fn latest_per_account(&self) -> Result<Vec<ProfileSnapshot>, StorageError> {
        let rows = sqlx::query(LATEST_PER_ACCOUNT_SQL)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    /// Full history for one account, oldest first. Unknown names yield an empty list.
    pub async fn history_for(&self, display_name: &str) -> Result<Vec<ProfileSnapshot>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT a.display_name, s.observed_at, s.rank, s.upload, s.current_upload,
                   s.current_download, s.points, s.seeding_count
              FROM snapshots s
              JOIN accounts a ON a.id = s.account_id
             WHERE a.display_name = ?
             ORDER BY s.observed_at ASC, s.id ASC
            "#,
        )
        .bind(display_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    /// Load accounts and history exported by the legacy JSON tracker in one transaction.
    ///
    /// History records whose owner is not among `accounts` are skipped. Any failed
    /// insert rolls the whole import back.
    pub async fn import_legacy(
        &self,
        accounts: &[NewAccount],
        history: &[ProfileSnapshot],
    ) -> Result<ImportSummary, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ImportSummary::default();
        let mut ids = std::collections::HashMap::with_capacity(accounts.len());

        for account in accounts {
            let result = sqlx::query(INSERT_ACCOUNT_SQL)
                .bind(&account.display_name)
                .bind(&account.remote_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| StorageError::from_account_insert(err, &account.display_name))?;
            ids.insert(account.display_name.as_str(), result.last_insert_rowid());
            summary.accounts += 1;
            info!(account = %account.display_name, id = result.last_insert_rowid(), "imported account");
        }

        for (idx, record) in history.iter().enumerate() {
            let Some(&account_id) = ids.get(record.owner.as_str()) else {
                warn!(owner = %record.owner, "skipping history record for unknown owner");
                summary.skipped += 1;
                continue;
            };
            sqlx::query(INSERT_SNAPSHOT_SQL)
                .bind(account_id)
                .bind(encode_timestamp(record.timestamp))
                .bind(record.rank)
                .bind(&record.upload)
                .bind(&record.current_upload)
                .bind(&record.current_download)
                .bind(record.points)
                .bind(record.seeding_count)
                .execute(&mut *tx)
                .await
                .map_err(|err| StorageError::from_snapshot_insert(err, account_id))?;
            summary.snapshots += 1;
            if (idx + 1) % 100 == 0 {
                info!(processed = idx + 1, "importing history records");
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}

/// Catalog of tracked accounts. Shares the store's connection pool.
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    pool: SqlitePool,
}

impl AccountRegistry {
    pub async fn add(&self, account: &NewAccount) -> Result<Account, StorageError> {
        let result = sqlx::query(INSERT_ACCOUNT_SQL)
            .bind(&account.display_name)
            .bind(&account.remote_id)
            .execute(&self.pool)
            .await
            .map_err(|err| StorageError::from_account_insert(err, &account.display_name))?;
        Ok(Account {
            id: result.last_insert_rowid(),
            display_name: account.display_name.clone(),
            remote_id: account.remote_id.clone(),
        })
    }

    /// All accounts in insertion order.
    pub async fn list(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query("SELECT id, display_name, remote_id FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw profile pages, kept for diagnosing extraction drift.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        remote_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let dir = remote_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        let dir = if dir.is_empty() { "unknown".to_string() } else { dir };
        PathBuf::from(stamp)
            .join(dir)
            .join(format!("{content_hash}.html"))
    }

    /// Write the page through a temp file + rename; identical content is stored once.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        remote_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.page_relative_path(fetched_at, remote_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let page = ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated: true,
        };
        if fs::try_exists(&page.absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", page.absolute_path.display()))?
        {
            return Ok(page);
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp page {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp page {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &page.absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp page {} -> {}",
                    temp_path.display(),
                    page.absolute_path.display()
                )
            });
        }

        Ok(ArchivedPage {
            deduplicated: false,
            ..page
        })
    }
}
