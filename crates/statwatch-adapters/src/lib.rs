//! Profile page retrieval + label-keyed field extraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::COOKIE;
pub use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use statwatch_core::{Account, Credentials, ProfileSnapshot};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "statwatch-adapters";

pub const DEFAULT_BASE_URL: &str = "https://ncore.pro/profile.php?id=";

static LABEL_ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(".userbox_tartalom_mini .profil_jobb_elso2").expect("static selector")
});

static SEEDING_HEADER_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".lista_mini_fej").expect("static selector"));

static PARENTHESIZED_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)\)").expect("static regex"));

/// The closed set of labels the profile page pairs with a value cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileLabel {
    Rank,
    Upload,
    CurrentUpload,
    CurrentDownload,
    Points,
}

impl ProfileLabel {
    pub const ALL: [ProfileLabel; 5] = [
        ProfileLabel::Rank,
        ProfileLabel::Upload,
        ProfileLabel::CurrentUpload,
        ProfileLabel::CurrentDownload,
        ProfileLabel::Points,
    ];

    /// Label text as rendered by the source, without the trailing colon.
    pub fn source_text(self) -> &'static str {
        match self {
            ProfileLabel::Rank => "Helyezés",
            ProfileLabel::Upload => "Feltöltés",
            ProfileLabel::CurrentUpload => "Aktuális feltöltés",
            ProfileLabel::CurrentDownload => "Aktuális letöltés",
            ProfileLabel::Points => "Pontok száma",
        }
    }

    pub fn recognize(label: &str) -> Option<Self> {
        let normalized = label.trim().trim_end_matches(':').trim_end();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.source_text() == normalized)
    }

    /// Assign `value` to the field this label names. Unparsable numbers become zero.
    pub fn apply(self, snapshot: &mut ProfileSnapshot, value: &str) {
        match self {
            ProfileLabel::Rank => snapshot.rank = parse_count(value),
            ProfileLabel::Upload => snapshot.upload = value.to_string(),
            ProfileLabel::CurrentUpload => snapshot.current_upload = value.to_string(),
            ProfileLabel::CurrentDownload => snapshot.current_download = value.to_string(),
            ProfileLabel::Points => snapshot.points = parse_count(value),
        }
    }
}

fn is_digit_separator(c: char) -> bool {
    matches!(c, ' ' | '\u{a0}' | '\u{202f}' | ',' | '.' | '\'')
}

/// `"42."` -> 42, `"1 234"` -> 1234, anything unparsable -> 0.
///
/// Separators only count between groups of exactly three digits, so decimals
/// such as `"12.5"` are unparsable rather than read as 125.
pub fn parse_count(value: &str) -> i64 {
    let trimmed = value
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | ':'))
        .trim_end();
    let groups: Vec<&str> = trimmed.split(is_digit_separator).collect();
    if let Some((first, rest)) = groups.split_first() {
        let grouped = first.is_empty() || first.len() > 3 || rest.iter().any(|g| g.len() != 3);
        if !rest.is_empty() && grouped {
            return 0;
        }
    }
    groups.concat().parse().unwrap_or(0)
}

/// First parenthesised integer in `text`, e.g. `"Seeding (12)"` -> 12.
pub fn extract_seeding_count(text: &str) -> Option<i64> {
    PARENTHESIZED_COUNT
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Build a snapshot from a parsed profile page. Never fails; missing fields stay zero.
pub fn extract_snapshot(
    document: &Html,
    owner: &str,
    observed_at: DateTime<Utc>,
) -> ProfileSnapshot {
    let mut snapshot = ProfileSnapshot::empty(owner, observed_at);

    for label_cell in document.select(&LABEL_ROW_SELECTOR) {
        let Some(label) = ProfileLabel::recognize(&element_text(label_cell)) else {
            continue;
        };
        let value = label_cell
            .next_siblings()
            .find_map(ElementRef::wrap)
            .map(element_text)
            .unwrap_or_default();
        label.apply(&mut snapshot, &value);
    }

    for header in document.select(&SEEDING_HEADER_SELECTOR) {
        if let Some(count) = extract_seeding_count(&element_text(header)) {
            snapshot.seeding_count = count;
        }
    }

    snapshot
}

pub fn parse_profile_page(html: &str, owner: &str, observed_at: DateTime<Utc>) -> ProfileSnapshot {
    let document = Html::parse_document(html);
    extract_snapshot(&document, owner, observed_at)
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: StatusCode,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request for {display_name} failed: {source}")]
    Request {
        display_name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {display_name} ({url})")]
    HttpStatus {
        display_name: String,
        status: u16,
        url: String,
    },
}

/// Anything that can produce the raw profile page for an account.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch(&self, account: &Account) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for SourceClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Authenticated, single-attempt profile fetcher.
#[derive(Debug, Clone)]
pub struct SourceClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl SourceClient {
    pub fn new(config: SourceClientConfig, credentials: Credentials) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            base_url: config.base_url,
            credentials,
        })
    }

    pub fn profile_url(&self, remote_id: &str) -> String {
        format!("{}{}", self.base_url, remote_id)
    }

    pub async fn fetch_profile(&self, account: &Account) -> Result<FetchedPage, FetchError> {
        let url = self.profile_url(&account.remote_id);
        let request_error = |source| FetchError::Request {
            display_name: account.display_name.clone(),
            source,
        };

        let resp = self
            .client
            .get(&url)
            .header(COOKIE, self.credentials.cookie_header())
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                display_name: account.display_name.clone(),
                status: status.as_u16(),
                url,
            });
        }

        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(request_error)?;
        debug!(account = %account.display_name, bytes = body.len(), "fetched profile page");
        Ok(FetchedPage {
            url: final_url,
            status,
            body,
            // Stored timestamps keep microseconds; match that here.
            fetched_at: Utc::now().trunc_subsecs(6),
        })
    }
}

#[async_trait]
impl ProfileSource for SourceClient {
    async fn fetch(&self, account: &Account) -> Result<FetchedPage, FetchError> {
        self.fetch_profile(account).await
    }
}
