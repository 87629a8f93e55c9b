//! Section-level text records built from stored revisions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use compact_str::CompactString;

use crate::{
    markup::{default_normalizer, Normalizer},
    revision::Revision,
    sections::{segment, Section},
    store::{RevisionListing, RevisionStore, StoreError, StoredRevision},
};

/// One non-empty section of one revision, with the revision's metadata.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CorpusRecord {
    pub article: CompactString,
    pub revision_id: CompactString,
    pub timestamp: DateTime<Utc>,
    pub contributor: Option<CompactString>,
    pub section_name: CompactString,
    pub section_level: u32,
    pub section_text: String,
}

/// Normalize and segment the body of `revision`.
pub fn revision_sections(revision: &Revision, normalizer: &Normalizer) -> Vec<Section> {
    segment(&normalizer.normalize(revision.text.as_str()))
}

/// Records of a single revision in document order. Sections with an empty body are dropped.
pub fn records_for_revision(
    article: &str,
    revision: &Revision,
    normalizer: &Normalizer,
) -> Vec<CorpusRecord> {
    revision_sections(revision, normalizer)
        .into_iter()
        .filter(|section| !section.body.is_empty())
        .map(|section| CorpusRecord {
            article: CompactString::from(article),
            revision_id: revision.id.clone(),
            timestamp: revision.timestamp,
            contributor: revision.contributor.clone(),
            section_name: section.name,
            section_level: section.level,
            section_text: section.body,
        })
        .collect()
}

/// Load a stored revision for corpus output.
///
/// A file that does not parse is logged and yields `Ok(None)`, or an error with the `strict`
/// feature. Failing to read the file at all is always an error.
pub fn load_or_skip(stored: &StoredRevision) -> Result<Option<Revision>, StoreError> {
    match stored.load() {
        Ok(revision) => Ok(Some(revision)),
        Err(e @ (StoreError::Malformed { .. } | StoreError::Xml { .. })) => {
            tracing::error!(message = "could not parse stored revision", path = %stored.path.display(), error = %e);
            if cfg!(feature = "strict") {
                return Err(e);
            }
            tracing::warn!("Ignoring unparsable revision file");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Lazily turn every stored revision of `article` into corpus records, in store listing order.
pub fn assemble<'a>(store: &'a RevisionStore, article: &str) -> CorpusAssembler<'a> {
    assemble_with(store, article, default_normalizer())
}

pub fn assemble_with<'a>(
    store: &'a RevisionStore,
    article: &str,
    normalizer: &'a Normalizer,
) -> CorpusAssembler<'a> {
    CorpusAssembler {
        article: CompactString::from(article),
        listing: store.list_revisions(article),
        normalizer,
        pending: VecDeque::new(),
        failed: false,
        revisions: 0,
        skipped: 0,
    }
}

pub struct CorpusAssembler<'a> {
    article: CompactString,
    listing: RevisionListing<'a>,
    normalizer: &'a Normalizer,
    pending: VecDeque<CorpusRecord>,
    failed: bool,
    revisions: usize,
    skipped: usize,
}

impl CorpusAssembler<'_> {
    /// Number of revisions turned into records so far.
    pub fn revisions(&self) -> usize {
        self.revisions
    }

    /// Number of stored revisions that could not be parsed and were left out.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn fail(&mut self, error: StoreError) -> Option<Result<CorpusRecord, StoreError>> {
        self.failed = true;
        Some(Err(error))
    }
}

impl Iterator for CorpusAssembler<'_> {
    type Item = Result<CorpusRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.failed {
                return None;
            }

            let stored = match self.listing.next()? {
                Ok(stored) => stored,
                Err(e) => return self.fail(e),
            };

            let revision = match load_or_skip(&stored) {
                Ok(Some(revision)) => revision,
                Ok(None) => {
                    self.skipped += 1;
                    continue;
                }
                Err(e) => return self.fail(e),
            };

            self.revisions += 1;
            self.pending
                .extend(records_for_revision(&self.article, &revision, self.normalizer));
        }
    }
}
