//! Core domain model for statwatch: tracked accounts and their profile snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "statwatch-core";

/// Store-assigned account identifier (SQLite rowid).
pub type AccountId = i64;

/// A tracked remote profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    pub remote_id: String,
}

/// Account as supplied by the administrative entry point, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub display_name: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountSpecError {
    #[error("expected `DisplayName,RemoteID`, got {parts} comma-separated part(s) in {input:?}")]
    WrongArity { input: String, parts: usize },
    #[error("display name and remote id must both be non-empty in {input:?}")]
    EmptyPart { input: String },
}

impl NewAccount {
    pub fn new(display_name: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            remote_id: remote_id.into(),
        }
    }

    /// Parse the `"<DisplayName>,<RemoteID>"` form used by the `add-account` command.
    pub fn parse(input: &str) -> Result<Self, AccountSpecError> {
        let parts: Vec<&str> = input.split(',').collect();
        if parts.len() != 2 {
            return Err(AccountSpecError::WrongArity {
                input: input.to_string(),
                parts: parts.len(),
            });
        }
        let display_name = parts[0].trim();
        let remote_id = parts[1].trim();
        if display_name.is_empty() || remote_id.is_empty() {
            return Err(AccountSpecError::EmptyPart {
                input: input.to_string(),
            });
        }
        Ok(Self::new(display_name, remote_id))
    }
}

/// One immutable observation of an account's statistics.
///
/// `upload`, `current_upload` and `current_download` keep the unit-qualified text
/// shown by the source (e.g. `"1.23 TiB"`); numeric fields are zero when they could
/// not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    pub rank: i64,
    pub upload: String,
    pub current_upload: String,
    pub current_download: String,
    pub points: i64,
    pub seeding_count: i64,
}

impl ProfileSnapshot {
    /// The zero-valued snapshot extraction starts from.
    pub fn empty(owner: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            timestamp,
            rank: 0,
            upload: String::new(),
            current_upload: String::new(),
            current_download: String::new(),
            points: 0,
            seeding_count: 0,
        }
    }
}

/// Opaque credential pair attached to outbound profile fetches.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub nick: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(nick: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            pass: pass.into(),
        }
    }

    pub fn cookie_header(&self) -> String {
        format!("nick={}; pass={}", self.nick, self.pass)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("nick", &self.nick)
            .field("pass", &"<redacted>")
            .finish()
    }
}
