//! Source contracts for the review platform: query strategies, the HTTP
//! client, and a fixture-style static source for tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prh_core::RawNote;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "prh-source";

pub const DEFAULT_BASE_URL: &str = "https://api2.openreview.net";
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("authentication rejected for {username}")]
    Auth { username: String },
    #[error("{0}")]
    Message(String),
}

/// The entity kinds the harvester discovers, each with its own strategy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Papers,
    Reviews,
    Decisions,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Papers => "papers",
            Self::Reviews => "reviews",
            Self::Decisions => "decisions",
        }
    }
}

/// One query against the platform's note index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoteQuery {
    pub invitation: Option<String>,
    pub content: Vec<(String, String)>,
    pub forum: Option<String>,
}

impl NoteQuery {
    pub fn for_invitation(invitation: impl Into<String>) -> Self {
        Self {
            invitation: Some(invitation.into()),
            ..Self::default()
        }
    }

    pub fn for_content(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            content: vec![(field.into(), value.into())],
            ..Self::default()
        }
    }

    pub fn with_forum(mut self, forum: impl Into<String>) -> Self {
        self.forum = Some(forum.into());
        self
    }

    /// Canonical text form, used for logging and for keying canned results
    /// in [`StaticNoteSource`].
    pub fn cache_key(&self) -> String {
        let mut parts = Vec::new();
        if let Some(invitation) = &self.invitation {
            parts.push(format!("invitation={invitation}"));
        }
        for (field, value) in &self.content {
            parts.push(format!("content.{field}={value}"));
        }
        if let Some(forum) = &self.forum {
            parts.push(format!("forum={forum}"));
        }
        parts.join("&")
    }
}

/// The capability the pipeline consumes: query notes by criteria, fetch a
/// binary attachment by note id and content field.
#[async_trait]
pub trait NoteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<RawNote>, SourceError>;

    async fn fetch_attachment(&self, note_id: &str, field: &str)
        -> Result<Vec<u8>, SourceError>;
}

/// Declarative specification of one way to discover an entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyDescriptor {
    /// Invitation-suffix query, resolved to `{venue_id}/-/{suffix}`.
    Invitation { suffix: String },
    /// Content-field equality query against the venue id, or against its
    /// alternate spelling when `alternate` is set.
    VenueField {
        field: String,
        #[serde(default)]
        alternate: bool,
    },
}

impl StrategyDescriptor {
    pub fn invitation(suffix: &str) -> Self {
        Self::Invitation {
            suffix: suffix.to_string(),
        }
    }

    /// Short name for logs and summaries.
    pub fn label(&self) -> String {
        match self {
            Self::Invitation { suffix } => suffix.clone(),
            Self::VenueField {
                field,
                alternate: false,
            } => field.clone(),
            Self::VenueField {
                field,
                alternate: true,
            } => format!("alt-{field}"),
        }
    }

    /// Resolve against a scope. `None` when the descriptor needs an
    /// alternate venue form the scope does not have.
    pub fn to_query(&self, scope: &QueryScope) -> Option<NoteQuery> {
        let mut query = match self {
            Self::Invitation { suffix } => {
                NoteQuery::for_invitation(format!("{}/-/{}", scope.venue_id, suffix))
            }
            Self::VenueField {
                field,
                alternate: false,
            } => NoteQuery::for_content(field.clone(), scope.venue_id.clone()),
            Self::VenueField {
                field,
                alternate: true,
            } => NoteQuery::for_content(field.clone(), scope.alternate_venue_id.clone()?),
        };
        query.forum = scope.forum.clone();
        Some(query)
    }
}

/// Venue context a strategy resolves inside, with an optional forum
/// restriction for per-paper discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    pub venue_id: String,
    pub alternate_venue_id: Option<String>,
    pub forum: Option<String>,
}

impl QueryScope {
    pub fn for_venue(venue_id: impl Into<String>) -> Self {
        let venue_id = venue_id.into();
        let alternate_venue_id = alternate_venue_id(&venue_id);
        Self {
            venue_id,
            alternate_venue_id,
            forum: None,
        }
    }

    pub fn with_forum(mut self, forum: impl Into<String>) -> Self {
        self.forum = Some(forum.into());
        self
    }
}

/// The platform has shipped venue ids in two spellings over the years;
/// toggling the `.cc` suffix on the first path segment yields the other one.
pub fn alternate_venue_id(venue_id: &str) -> Option<String> {
    let (head, rest) = match venue_id.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (venue_id, None),
    };
    if head.is_empty() {
        return None;
    }
    let toggled = match head.strip_suffix(".cc") {
        Some(bare) => bare.to_string(),
        None => format!("{head}.cc"),
    };
    Some(match rest {
        Some(rest) => format!("{toggled}/{rest}"),
        None => toggled,
    })
}

/// Ordered strategies for one entity kind. `accumulate` results merge;
/// `fallback` is only consulted when `accumulate` produced nothing, and
/// stops at the first strategy that yields records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StrategySet {
    #[serde(default)]
    pub accumulate: Vec<StrategyDescriptor>,
    #[serde(default)]
    pub fallback: Vec<StrategyDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StrategyTable {
    #[serde(default)]
    pub papers: StrategySet,
    #[serde(default)]
    pub reviews: StrategySet,
    #[serde(default)]
    pub decisions: StrategySet,
}

impl StrategyTable {
    /// The discovery paths observed across harvested venues.
    pub fn builtin() -> Self {
        Self {
            papers: StrategySet {
                accumulate: vec![
                    StrategyDescriptor::invitation("Submission"),
                    StrategyDescriptor::invitation("Blind_Submission"),
                    StrategyDescriptor::invitation("ARR_Commitment"),
                    StrategyDescriptor::invitation("Direct_Submission"),
                ],
                fallback: vec![
                    StrategyDescriptor::VenueField {
                        field: "venueid".to_string(),
                        alternate: false,
                    },
                    StrategyDescriptor::VenueField {
                        field: "venueid".to_string(),
                        alternate: true,
                    },
                ],
            },
            reviews: StrategySet {
                accumulate: vec![
                    StrategyDescriptor::invitation("Official_Review"),
                    StrategyDescriptor::invitation("ARR_Review"),
                    StrategyDescriptor::invitation("Review"),
                    StrategyDescriptor::invitation("Public_Review"),
                    StrategyDescriptor::invitation("Paper_Review"),
                    StrategyDescriptor::invitation("Anonymous_Review"),
                ],
                fallback: Vec::new(),
            },
            decisions: StrategySet {
                accumulate: vec![
                    StrategyDescriptor::invitation("Decision"),
                    StrategyDescriptor::invitation("ARR_Decision"),
                    StrategyDescriptor::invitation("Acceptance_Decision"),
                    StrategyDescriptor::invitation("Program_Committee_Decision"),
                ],
                fallback: Vec::new(),
            },
        }
    }

    /// Load an override table from a YAML registry file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading strategy registry {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing strategy registry {}", path.display()))
    }

    pub fn set_for(&self, kind: EntityKind) -> &StrategySet {
        match kind {
            EntityKind::Papers => &self.papers,
            EntityKind::Reviews => &self.reviews,
            EntityKind::Decisions => &self.decisions,
        }
    }
}

/// Platform-side trouble worth another attempt: overload and rate limiting.
/// Client errors (bad query, missing auth) never are.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Capped exponential backoff between query attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before re-trying the zero-based `attempt`: base doubled per
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Connection settings for the platform API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            user_agent: "peer-review-harvester/0.1".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("PRH_API_BASE_URL").unwrap_or(defaults.base_url),
            username: std::env::var("OPENREVIEW_USERNAME")
                .ok()
                .filter(|v| !v.is_empty()),
            password: std::env::var("OPENREVIEW_PASSWORD")
                .ok()
                .filter(|v| !v.is_empty()),
            timeout: std::env::var("PRH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("PRH_USER_AGENT").unwrap_or(defaults.user_agent),
            page_size: std::env::var("PRH_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            backoff: defaults.backoff,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NotesPage {
    #[serde(default)]
    notes: Vec<RawNote>,
}

fn notes_query_params(query: &NoteQuery, page_size: usize, offset: usize) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if let Some(invitation) = &query.invitation {
        params.push(("invitation".to_string(), invitation.clone()));
    }
    for (field, value) in &query.content {
        params.push((format!("content.{field}"), value.clone()));
    }
    if let Some(forum) = &query.forum {
        params.push(("forum".to_string(), forum.clone()));
    }
    params.push(("limit".to_string(), page_size.to_string()));
    params.push(("offset".to_string(), offset.to_string()));
    params
}

/// HTTP client against the review platform. Reads work unauthenticated for
/// public venues; configured credentials are exchanged for a bearer token
/// once at connect time.
#[derive(Debug)]
pub struct OpenReviewSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
    backoff: BackoffPolicy,
}

impl OpenReviewSource {
    pub async fn connect(config: ApiConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let token = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                Some(Self::login(&client, &base_url, username, password).await?)
            }
            _ => None,
        };

        Ok(Self {
            client,
            base_url,
            token,
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        })
    }

    async fn login(
        client: &reqwest::Client,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, SourceError> {
        let url = format!("{base_url}/login");
        let response = client
            .post(&url)
            .json(&serde_json::json!({"id": username, "password": password}))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Auth {
                username: username.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body: LoginResponse = response.json().await?;
        if body.token.is_empty() {
            return Err(SourceError::Auth {
                username: username.to_string(),
            });
        }
        debug!(username, "authenticated against review platform");
        Ok(body.token)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.get(url);
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, SourceError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.get(url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let final_url = response.url().to_string();
                    if retryable_status(status) && attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if retryable_transport(&err) && attempt < self.backoff.max_retries {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(SourceError::Request(err)),
            None => Err(SourceError::Message(format!("retries exhausted for {url}"))),
        }
    }
}

#[async_trait]
impl NoteSource for OpenReviewSource {
    fn source_id(&self) -> &'static str {
        "openreview"
    }

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<RawNote>, SourceError> {
        let url = format!("{}/notes", self.base_url);
        let mut notes = Vec::new();
        let mut offset = 0usize;

        loop {
            let params = notes_query_params(query, self.page_size, offset);
            let response = self.get_with_retry(&url, &params).await?;
            let page: NotesPage = response.json().await?;

            let fetched = page.notes.len();
            notes.extend(page.notes);
            if fetched < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        debug!(query = %query.cache_key(), count = notes.len(), "queried notes");
        Ok(notes)
    }

    async fn fetch_attachment(
        &self,
        note_id: &str,
        field: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/attachment", self.base_url);
        let params = [
            ("id".to_string(), note_id.to_string()),
            ("name".to_string(), field.to_string()),
        ];
        let response = self.get_with_retry(&url, &params).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// In-memory source serving canned notes, keyed by [`NoteQuery::cache_key`].
/// The fixture-first counterpart to the HTTP client: tests register results,
/// inject failures, and assert on what was asked for.
#[derive(Debug, Default)]
pub struct StaticNoteSource {
    notes: HashMap<String, Vec<RawNote>>,
    failures: HashSet<String>,
    attachments: HashMap<String, Vec<u8>>,
    queries: Mutex<Vec<String>>,
    attachment_requests: AtomicUsize,
}

impl StaticNoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notes(mut self, query: &NoteQuery, notes: Vec<RawNote>) -> Self {
        self.notes.insert(query.cache_key(), notes);
        self
    }

    pub fn with_failure(mut self, query: &NoteQuery) -> Self {
        self.failures.insert(query.cache_key());
        self
    }

    pub fn with_attachment(mut self, note_id: &str, field: &str, bytes: Vec<u8>) -> Self {
        self.attachments.insert(format!("{note_id}:{field}"), bytes);
        self
    }

    /// Every cache key asked of this source, in call order.
    pub fn recorded_queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn attachment_request_count(&self) -> usize {
        self.attachment_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NoteSource for StaticNoteSource {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn query_notes(&self, query: &NoteQuery) -> Result<Vec<RawNote>, SourceError> {
        let key = query.cache_key();
        if let Ok(mut log) = self.queries.lock() {
            log.push(key.clone());
        }
        if self.failures.contains(&key) {
            return Err(SourceError::Message(format!("injected failure for {key}")));
        }
        Ok(self.notes.get(&key).cloned().unwrap_or_default())
    }

    async fn fetch_attachment(
        &self,
        note_id: &str,
        field: &str,
    ) -> Result<Vec<u8>, SourceError> {
        self.attachment_requests.fetch_add(1, Ordering::Relaxed);
        self.attachments
            .get(&format!("{note_id}:{field}"))
            .cloned()
            .ok_or_else(|| SourceError::Message(format!("no attachment for note {note_id}")))
    }
}
