//! Revision history queries against the MediaWiki action API.
//!
//! [`RevisionApi`] is the pagination contract used by the fetcher: one call returns one page of
//! revisions plus an optional continuation cursor. [`MediaWikiClient`] implements it over blocking
//! HTTP with a per-request deadline, a minimum spacing between requests and bounded retries.

use std::{
    env,
    thread::sleep,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use rand::Rng;
use reqwest::{blocking::Client, StatusCode};

use crate::revision::{format_timestamp, MalformedRevisionError, Revision, RevisionBuilder};

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "wikicorpus/",
    env!("CARGO_PKG_VERSION"),
    " (revision history corpus builder)"
);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),
    #[error("API responded with HTTP {0}")]
    Status(StatusCode),
    #[error("API error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("invalid XML in API response")]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedRevisionError),
    #[error("API returned the continuation cursor {cursor:?} twice in a row")]
    StalledCursor { cursor: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionQuery {
    pub article: String,
    /// Only revisions at or after this instant are requested.
    pub since: DateTime<Utc>,
    /// Opaque, server-issued. `None` on the first request.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionPage {
    /// The article does not exist upstream.
    pub missing: bool,
    pub revisions: Vec<Revision>,
    pub cursor: Option<String>,
    /// Revisions dropped because a mandatory field was missing.
    pub skipped: usize,
}

pub trait RevisionApi {
    fn query_revisions(&mut self, query: &RevisionQuery) -> Result<RevisionPage, TransportError>;
    fn request_count(&self) -> usize;
}

impl<A: RevisionApi + ?Sized> RevisionApi for &mut A {
    fn query_revisions(&mut self, query: &RevisionQuery) -> Result<RevisionPage, TransportError> {
        (**self).query_revisions(query)
    }

    fn request_count(&self) -> usize {
        (**self).request_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub user_agent: String,
    /// Deadline for a single request, including reading the body.
    pub timeout_ms: u64,
    /// Minimum time between the start of two requests.
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    /// Delay before the first retry, doubled on every further attempt.
    pub retry_delay_ms: u64,
    /// `rvlimit`, either a number or `max`.
    pub batch_limit: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 60_000,
            rate_limit_ms: 200,
            max_retries: 3,
            retry_delay_ms: 1_000,
            batch_limit: "max".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: env_value("WIKICORPUS_API_URL", &defaults.api_url),
            user_agent: env_value("WIKICORPUS_USER_AGENT", &defaults.user_agent),
            timeout_ms: env_value_u64("WIKICORPUS_TIMEOUT_MS", defaults.timeout_ms),
            rate_limit_ms: env_value_u64("WIKICORPUS_RATE_LIMIT_MS", defaults.rate_limit_ms),
            max_retries: env_value_usize("WIKICORPUS_RETRIES", defaults.max_retries),
            retry_delay_ms: env_value_u64("WIKICORPUS_RETRY_DELAY_MS", defaults.retry_delay_ms),
            batch_limit: env_value("WIKICORPUS_BATCH_LIMIT", &defaults.batch_limit),
        }
    }
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Exponential part of the retry delay, capped at 256 times the base delay.
fn backoff_delay(retry_delay_ms: u64, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(8).min(8);
    let scale = 1u64.checked_shl(exponent).unwrap_or(256);
    Duration::from_millis(retry_delay_ms.saturating_mul(scale))
}

pub struct MediaWikiClient {
    client: Client,
    config: ClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn from_env() -> Result<Self, TransportError> {
        Self::new(ClientConfig::from_env())
    }

    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured HTTP client. Its own timeout and user agent take precedence over
    /// `config.timeout_ms` and `config.user_agent`.
    pub fn with_client(client: Client, config: ClientConfig) -> Self {
        Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request_xml(&mut self, params: &[(&str, String)]) -> Result<String, TransportError> {
        let mut attempt = 0;
        loop {
            self.apply_rate_limit();
            let retries_left = attempt < self.config.max_retries;
            let response = self
                .client
                .get(&self.config.api_url)
                .query(params)
                .send();

            let failure: TransportError = match response {
                Ok(response) if response.status().is_success() => match response.text() {
                    Ok(body) => return Ok(body),
                    Err(error) if retries_left && is_retryable_error(&error) => error.into(),
                    Err(error) => return Err(error.into()),
                },
                Ok(response) => {
                    let status = response.status();
                    if !(retries_left && is_retryable_status(status)) {
                        return Err(TransportError::Status(status));
                    }
                    TransportError::Status(status)
                }
                Err(error) if retries_left && is_retryable_error(&error) => error.into(),
                Err(error) => return Err(error.into()),
            };

            tracing::warn!(message = "retrying API request", attempt, error = %failure);
            self.wait_before_retry(attempt);
            attempt += 1;
        }
    }

    fn apply_rate_limit(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            let required = Duration::from_millis(self.config.rate_limit_ms);
            if elapsed < required {
                sleep(required - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count = self.request_count.saturating_add(1);
    }

    fn wait_before_retry(&self, attempt: usize) {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.config.retry_delay_ms / 2);
        let delay = backoff_delay(self.config.retry_delay_ms, attempt);
        sleep(delay + Duration::from_millis(jitter_ms));
    }
}

impl RevisionApi for MediaWikiClient {
    fn query_revisions(&mut self, query: &RevisionQuery) -> Result<RevisionPage, TransportError> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("format", "xml".to_string()),
            ("prop", "revisions".to_string()),
            ("titles", query.article.clone()),
            ("rvprop", "ids|timestamp|user|comment|content".to_string()),
            ("rvslots", "main".to_string()),
            ("rvlimit", self.config.batch_limit.clone()),
            ("rvdir", "newer".to_string()),
            ("rvstart", format_timestamp(&query.since)),
        ];
        if let Some(cursor) = &query.cursor {
            params.push(("rvcontinue", cursor.clone()));
        }

        tracing::debug!(message = "requesting revisions", article = %query.article, cursor = ?query.cursor);
        let body = self.request_xml(&params)?;
        parse_query_response(&body)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

// tags of a `action=query&prop=revisions&format=xml` response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Api,
    Continue,
    Query,
    Pages,
    Page,
    Revisions,
    Rev,
    Slots,
    Slot,
    Unknown,
}

impl Tag {
    fn from_start_bytes(e: &BytesStart) -> Self {
        match e.name().as_ref() {
            b"api" => Tag::Api,
            b"continue" => Tag::Continue,
            b"query" => Tag::Query,
            b"pages" => Tag::Pages,
            b"page" => Tag::Page,
            b"revisions" => Tag::Revisions,
            b"rev" => Tag::Rev,
            b"slots" => Tag::Slots,
            b"slot" => Tag::Slot,
            _ => Tag::Unknown,
        }
    }
}

fn attribute(e: &BytesStart, name: &[u8]) -> Result<Option<String>, quick_xml::Error> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Parse one XML response of a revisions query.
pub fn parse_query_response(xml: &str) -> Result<RevisionPage, TransportError> {
    use Tag::*;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut current_path: Vec<Tag> = Vec::new();
    let mut page = RevisionPage::default();
    let mut revision_builder: Option<RevisionBuilder> = None;

    loop {
        let (e, is_empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::Text(e) => {
                if let Some(builder) = revision_builder.as_mut() {
                    collect_body(&current_path, builder, &e.unescape()?);
                }
                continue;
            }
            Event::CData(e) => {
                if let Some(builder) = revision_builder.as_mut() {
                    collect_body(&current_path, builder, &String::from_utf8_lossy(&e.into_inner()));
                }
                continue;
            }
            Event::End(_) => {
                if current_path.pop() == Some(Rev) {
                    if let Some(builder) = revision_builder.take() {
                        finish_revision(builder, &mut page)?;
                    }
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        if e.name().as_ref() == b"error" && matches!(current_path.as_slice(), [Api]) {
            return Err(TransportError::Api {
                code: attribute(&e, b"code")?.unwrap_or_else(|| "unknown_error".to_string()),
                info: attribute(&e, b"info")?.unwrap_or_else(|| "unknown info".to_string()),
            });
        }

        let tag = Tag::from_start_bytes(&e);
        match (current_path.as_slice(), tag) {
            ([Api], Continue) => page.cursor = attribute(&e, b"rvcontinue")?,
            ([Api, Query, Pages], Page) => {
                if attribute(&e, b"missing")?.is_some() || attribute(&e, b"invalid")?.is_some() {
                    page.missing = true;
                }
            }
            ([Api, Query, Pages, Page, Revisions], Rev) => {
                let builder = RevisionBuilder::from_rev_start(&e)?;
                if is_empty {
                    finish_revision(builder, &mut page)?;
                } else {
                    revision_builder = Some(builder);
                }
            }
            ([.., Rev, Slots], Slot) => {
                if let Some(builder) = revision_builder.as_mut() {
                    builder.enter_slot();
                }
            }
            _ => {}
        }

        if !is_empty {
            current_path.push(tag);
        }
    }

    Ok(page)
}

fn collect_body(current_path: &[Tag], builder: &mut RevisionBuilder, text: &str) {
    match current_path {
        [.., Tag::Rev] => builder.push_text(text),
        [.., Tag::Rev, Tag::Slots, Tag::Slot] => builder.push_slot_text(text),
        _ => {}
    }
}

fn finish_revision(
    builder: RevisionBuilder,
    page: &mut RevisionPage,
) -> Result<(), TransportError> {
    match builder.try_build() {
        Ok(revision) => page.revisions.push(revision),
        Err(e) => {
            tracing::error!(message = "Missing mandatory field in revision", field = e.field, revision_id = ?e.revision_id);
            if cfg!(feature = "strict") {
                return Err(e.into());
            }
            tracing::warn!("Ignoring revision with missing mandatory field");
            page.skipped += 1;
        }
    }
    Ok(())
}
