//! Incremental download of an article's revision history.
//!
//! [`RevisionFetcher`] walks the continuation cursors of a [`RevisionApi`] one request at a time
//! and yields revisions in ascending timestamp order. [`sync_article`] drives it and writes every
//! revision through the [`RevisionStore`]. A failed run can simply be repeated: files that are
//! already stored are skipped.

use std::{collections::VecDeque, fmt::Display};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::instrument;

use crate::{
    api::{RevisionApi, RevisionQuery, TransportError},
    revision::{parse_timestamp, Revision},
    store::{RevisionStore, StoreError, WriteOutcome},
};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("article {article:?} does not exist")]
    NotFound { article: String },
    #[error("fetching revisions of {article:?} failed at cursor {cursor:?}")]
    Transport {
        article: String,
        cursor: Option<String>,
        #[source]
        source: TransportError,
    },
    #[error("storing revisions of {article:?} failed at cursor {cursor:?}")]
    Store {
        article: String,
        cursor: Option<String>,
        #[source]
        source: StoreError,
    },
}

/// Parse a `since` watermark: a date (`2023-01-31`, midnight UTC) or a full timestamp.
pub fn parse_watermark(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .or_else(|| parse_timestamp(text))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub pages: usize,
    pub yielded: usize,
    pub before_since: usize,
    pub out_of_order: usize,
    pub malformed: usize,
}

#[derive(Debug)]
enum State {
    Requesting { cursor: Option<String> },
    /// Revisions received before the failure are yielded first.
    Failing(FetchError),
    Done,
}

pub struct RevisionFetcher<A> {
    api: A,
    article: String,
    since: DateTime<Utc>,
    state: State,
    buffer: VecDeque<Revision>,
    last_cursor: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
    stats: FetchStats,
}

/// Lazily fetch all revisions of `article` with a timestamp at or after `since`.
///
/// No request is made before the first call to `next`.
pub fn fetch_since<A: RevisionApi>(
    api: A,
    article: &str,
    since: DateTime<Utc>,
) -> RevisionFetcher<A> {
    RevisionFetcher {
        api,
        article: article.to_string(),
        since,
        state: State::Requesting { cursor: None },
        buffer: VecDeque::new(),
        last_cursor: None,
        last_timestamp: None,
        stats: FetchStats::default(),
    }
}

impl<A: RevisionApi> RevisionFetcher<A> {
    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// Cursor of the most recent request, `None` for the first page.
    pub fn cursor(&self) -> Option<&str> {
        self.last_cursor.as_deref()
    }

    pub fn request_count(&self) -> usize {
        self.api.request_count()
    }

    fn request_page(&mut self, cursor: Option<String>) -> State {
        let query = RevisionQuery {
            article: self.article.clone(),
            since: self.since,
            cursor,
        };
        self.last_cursor.clone_from(&query.cursor);

        let page = match self.api.query_revisions(&query) {
            Ok(page) => page,
            Err(source) => {
                tracing::error!(message = "revision request failed", article = %self.article, cursor = ?query.cursor, error = %source);
                return State::Failing(FetchError::Transport {
                    article: self.article.clone(),
                    cursor: query.cursor,
                    source,
                });
            }
        };
        self.stats.pages += 1;

        if page.missing {
            return State::Failing(FetchError::NotFound {
                article: self.article.clone(),
            });
        }
        self.stats.malformed += page.skipped;

        let mut revisions = page.revisions;
        revisions.sort_by_key(|revision| revision.timestamp);
        for revision in revisions {
            if revision.timestamp < self.since {
                tracing::debug!(message = "skipping revision before watermark", revision_id = revision.id.as_str(), timestamp = %revision.timestamp);
                self.stats.before_since += 1;
                continue;
            }
            if self.last_timestamp.is_some_and(|last| revision.timestamp < last) {
                tracing::warn!(message = "skipping revision older than one already fetched", revision_id = revision.id.as_str(), timestamp = %revision.timestamp);
                self.stats.out_of_order += 1;
                continue;
            }
            self.last_timestamp = Some(revision.timestamp);
            self.buffer.push_back(revision);
        }

        match page.cursor {
            Some(next) if query.cursor.as_deref() == Some(next.as_str()) => {
                tracing::error!(message = "API did not advance the continuation cursor", cursor = next.as_str());
                State::Failing(FetchError::Transport {
                    article: self.article.clone(),
                    cursor: query.cursor,
                    source: TransportError::StalledCursor { cursor: next },
                })
            }
            Some(next) => State::Requesting { cursor: Some(next) },
            None => State::Done,
        }
    }
}

impl<A: RevisionApi> Iterator for RevisionFetcher<A> {
    type Item = Result<Revision, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(revision) = self.buffer.pop_front() {
                self.stats.yielded += 1;
                return Some(Ok(revision));
            }

            match std::mem::replace(&mut self.state, State::Done) {
                State::Done => return None,
                State::Failing(error) => return Some(Err(error)),
                State::Requesting { cursor } => self.state = self.request_page(cursor),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Watermark: revisions before it are neither requested nor stored.
    pub since: DateTime<Utc>,
    /// Overwrite revisions that are already stored instead of skipping them.
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub article: String,
    pub since: DateTime<Utc>,
    pub saved: usize,
    pub skipped: usize,
    pub replaced: usize,
    pub requests: usize,
    pub stats: FetchStats,
}

impl Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "saved {} new revisions of {} since {} ({} already stored, {} replaced, {} requests)",
            self.saved,
            self.article,
            self.since.format("%Y-%m-%d"),
            self.skipped,
            self.replaced,
            self.requests
        )
    }
}

/// Fetch everything since the watermark and store what is not stored yet.
#[instrument(skip(api, store))]
pub fn sync_article<A: RevisionApi>(
    api: A,
    store: &RevisionStore,
    article: &str,
    options: &SyncOptions,
) -> Result<SyncReport, FetchError> {
    let mut fetcher = fetch_since(api, article, options.since);
    let mut report = SyncReport {
        article: article.to_string(),
        since: options.since,
        saved: 0,
        skipped: 0,
        replaced: 0,
        requests: 0,
        stats: FetchStats::default(),
    };

    while let Some(revision) = fetcher.next() {
        let revision = revision?;
        let path = store.path_for(article, &revision);

        let stored = if options.force_refresh && store.exists(&path) {
            store.replace(&path, &revision).map(|()| report.replaced += 1)
        } else {
            store.write(&path, &revision).map(|outcome| match outcome {
                WriteOutcome::Written => report.saved += 1,
                WriteOutcome::AlreadyPresent => report.skipped += 1,
            })
        };

        if let Err(source) = stored {
            tracing::error!(message = "could not store revision", revision_id = revision.id.as_str(), error = %source);
            return Err(FetchError::Store {
                article: article.to_string(),
                cursor: fetcher.cursor().map(str::to_string),
                source,
            });
        }
    }

    report.requests = fetcher.request_count();
    report.stats = fetcher.stats();
    tracing::info!(
        message = "sync finished",
        saved = report.saved,
        skipped = report.skipped,
        replaced = report.replaced,
        requests = report.requests
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RevisionPage;
    use crate::test_support::prelude::*;

    fn ids(revisions: &[Revision]) -> Vec<&str> {
        revisions.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn parses_watermarks() {
        assert_eq!(
            parse_watermark("2023-01-31"),
            parse_timestamp("2023-01-31T00:00:00Z")
        );
        assert_eq!(
            parse_watermark("2023-01-31T12:30:00Z"),
            parse_timestamp("20230131123000")
        );
        assert_eq!(parse_watermark("31.01.2023"), None);
    }

    #[test]
    fn follows_cursors_until_exhausted() {
        let mut api = ScriptedApi::new([
            revision_page(
                vec![
                    timed_revision("1", "2020-01-01T00:00:00Z"),
                    timed_revision("2", "2020-01-02T00:00:00Z"),
                ],
                Some("c1"),
            ),
            revision_page(vec![], Some("c2")),
            revision_page(vec![timed_revision("3", "2020-02-01T00:00:00Z")], None),
        ]);

        let since = parse_watermark("2019-01-01").unwrap();
        let revisions: Vec<Revision> = fetch_since(&mut api, "Test", since)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(ids(&revisions), vec!["1", "2", "3"]);
        let cursors: Vec<Option<&str>> = api.queries.iter().map(|q| q.cursor.as_deref()).collect();
        assert_eq!(cursors, vec![None, Some("c1"), Some("c2")]);
        assert!(api.queries.iter().all(|q| q.article == "Test" && q.since == since));
        assert_eq!(api.request_count(), 3);
    }

    #[test]
    fn makes_no_request_until_polled() {
        let mut api = ScriptedApi::new([]);
        let fetcher = fetch_since(&mut api, "Test", parse_watermark("2020-01-01").unwrap());
        drop(fetcher);
        assert_eq!(api.request_count(), 0);
    }

    #[test]
    fn filters_by_watermark() {
        let mut api = ScriptedApi::new([revision_page(
            vec![
                timed_revision("1", "2020-12-31T23:59:59Z"),
                timed_revision("2", "2021-01-01T00:00:00Z"),
                timed_revision("3", "2021-01-05T00:00:00Z"),
            ],
            None,
        )]);

        let mut fetcher = fetch_since(&mut api, "Test", parse_watermark("2021-01-01").unwrap());
        let revisions: Vec<Revision> = fetcher.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids(&revisions), vec!["2", "3"]);
        assert_eq!(fetcher.stats().before_since, 1);
        assert_eq!(fetcher.stats().yielded, 2);
    }

    #[test]
    fn missing_article_is_terminal() {
        let mut api = ScriptedApi::new([RevisionPage {
            missing: true,
            ..RevisionPage::default()
        }]);

        let mut fetcher = fetch_since(&mut api, "Nope", parse_watermark("2020-01-01").unwrap());
        match fetcher.next() {
            Some(Err(FetchError::NotFound { article })) => assert_eq!(article, "Nope"),
            other => panic!("expected not found, got {:?}", other),
        }
        assert!(fetcher.next().is_none());
        drop(fetcher);
        assert_eq!(api.request_count(), 1);
    }

    #[test]
    fn transport_failure_aborts_after_received_revisions() {
        let mut api = ScriptedApi::new([revision_page(
            vec![timed_revision("1", "2020-01-01T00:00:00Z")],
            Some("c1"),
        )]);
        api.push_error(TransportError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));

        let mut fetcher = fetch_since(&mut api, "Test", parse_watermark("2020-01-01").unwrap());
        assert_eq!(fetcher.next().unwrap().unwrap().id, "1");
        match fetcher.next() {
            Some(Err(FetchError::Transport { cursor, source, .. })) => {
                assert_eq!(cursor.as_deref(), Some("c1"));
                assert!(matches!(source, TransportError::Status(_)));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
        assert!(fetcher.next().is_none());
    }

    #[test]
    fn stalled_cursor_is_an_error() {
        let mut api = ScriptedApi::new([
            revision_page(vec![timed_revision("1", "2020-01-01T00:00:00Z")], Some("c1")),
            revision_page(vec![], Some("c1")),
        ]);

        let since = parse_watermark("2020-01-01").unwrap();
        let results: Vec<_> = fetch_since(&mut api, "Test", since).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            &results[1],
            Err(FetchError::Transport {
                source: TransportError::StalledCursor { .. },
                ..
            })
        ));
    }

    #[test]
    fn keeps_timestamps_non_decreasing() {
        let mut api = ScriptedApi::new([
            revision_page(
                vec![
                    timed_revision("2", "2020-01-02T00:00:00Z"),
                    timed_revision("1", "2020-01-01T00:00:00Z"),
                ],
                Some("c1"),
            ),
            revision_page(
                vec![
                    timed_revision("0", "2019-12-31T00:00:00Z"),
                    timed_revision("3", "2020-01-02T00:00:00Z"),
                ],
                None,
            ),
        ]);

        let mut fetcher = fetch_since(&mut api, "Test", parse_watermark("2019-01-01").unwrap());
        let revisions: Vec<Revision> = fetcher.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids(&revisions), vec!["1", "2", "3"]);
        assert_eq!(fetcher.stats().out_of_order, 1);
    }

    #[test]
    fn sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RevisionStore::new(dir.path());
        let pages = || {
            [
                revision_page(
                    vec![
                        timed_revision("10", "2022-03-01T00:00:00Z"),
                        timed_revision("11", "2022-03-15T00:00:00Z"),
                    ],
                    Some("c1"),
                ),
                revision_page(vec![timed_revision("12", "2022-04-01T00:00:00Z")], None),
            ]
        };
        let options = SyncOptions {
            since: parse_watermark("2022-01-01").unwrap(),
            force_refresh: false,
        };

        let first = sync_article(ScriptedApi::new(pages()), &store, "Test", &options).unwrap();
        assert_eq!((first.saved, first.skipped, first.replaced), (3, 0, 0));
        assert_eq!(first.requests, 2);

        let second = sync_article(ScriptedApi::new(pages()), &store, "Test", &options).unwrap();
        assert_eq!((second.saved, second.skipped, second.replaced), (0, 3, 0));
        assert_eq!(store.list_revisions("Test").count(), 3);

        let refresh = SyncOptions {
            force_refresh: true,
            ..options
        };
        let third = sync_article(ScriptedApi::new(pages()), &store, "Test", &refresh).unwrap();
        assert_eq!((third.saved, third.skipped, third.replaced), (0, 0, 3));
        assert_eq!(store.list_revisions("Test").count(), 3);
    }

    #[test]
    fn sync_reports_store_failures() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();
        let store = RevisionStore::new(&blocker);

        let api = ScriptedApi::new([revision_page(
            vec![timed_revision("1", "2020-01-01T00:00:00Z")],
            None,
        )]);
        let options = SyncOptions {
            since: parse_watermark("2020-01-01").unwrap(),
            force_refresh: false,
        };
        match sync_article(api, &store, "Test", &options) {
            Err(FetchError::Store { article, cursor, .. }) => {
                assert_eq!(article, "Test");
                assert_eq!(cursor, None);
            }
            other => panic!("expected store error, got {:?}", other),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 500,
            ..ProptestConfig::default()
        })]
        #[test]
        fn yields_non_decreasing_timestamps(
            pages in proptest::collection::vec(proptest::collection::vec(0i64..1_000_000, 0..8), 1..6),
            since in 0i64..500_000,
        ) {
            let page_count = pages.len();
            let scripted = pages.into_iter().enumerate().map(|(page_index, seconds)| {
                let revisions = seconds
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| Revision {
                        id: format!("{page_index}-{i}").into(),
                        timestamp: DateTime::from_timestamp(1_500_000_000 + s, 0).unwrap(),
                        ..dummy_revision()
                    })
                    .collect();
                let cursor = (page_index + 1 < page_count).then(|| format!("c{page_index}"));
                RevisionPage { revisions, cursor, ..RevisionPage::default() }
            });
            let mut api = ScriptedApi::new(scripted);
            let since = DateTime::from_timestamp(1_500_000_000 + since, 0).unwrap();

            let revisions: Vec<Revision> = fetch_since(&mut api, "Test", since)
                .collect::<Result<_, _>>()
                .unwrap();
            prop_assert!(revisions.iter().all(|r| r.timestamp >= since));
            prop_assert!(revisions.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            prop_assert_eq!(api.request_count(), page_count);
        }
    }
}
