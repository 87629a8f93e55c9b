//! On-disk layout of fetched revisions: `<root>/<article>/<YYYY>/<MM>/<revision id>.xml`.
//!
//! Every file holds exactly one revision in the `<rev>` container format of
//! [`Revision::to_xml`]. Files are created atomically (written to a temporary file in the same
//! directory, then hard-linked into place), so a concurrent run never sees a torn file and never
//! overwrites one that is already present.

use std::{
    cmp::Ordering,
    fmt::Display,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Utc};
use compact_str::CompactString;

use crate::revision::{Revision, RevisionXmlError};

const EXTENSION: &str = "xml";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stored revision {} is not valid XML", path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },
    #[error("stored revision {} is malformed", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: RevisionXmlError,
    },
    #[error("{} is not a revision path inside the store", path.display())]
    InvalidPath { path: PathBuf },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, error: RevisionXmlError) -> StoreError {
        match error {
            RevisionXmlError::XmlError(source) => StoreError::Xml {
                path: path.to_path_buf(),
                source,
            },
            source => StoreError::Malformed {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(timestamp: &DateTime<Utc>) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }

    fn parse_dirs(year: &str, month: &str) -> Option<Self> {
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = year.parse().ok()?;
        let month = month.parse().ok()?;
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyPresent,
}

/// Handle to one revision file in the store. The file is only read on [`StoredRevision::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRevision {
    pub article: CompactString,
    pub year_month: YearMonth,
    pub revision_id: CompactString,
    pub path: PathBuf,
}

impl StoredRevision {
    pub fn read_raw(&self) -> Result<String, StoreError> {
        fs::read_to_string(&self.path).map_err(StoreError::io(&self.path))
    }

    pub fn load(&self) -> Result<Revision, StoreError> {
        let xml = self.read_raw()?;
        Revision::from_xml(&xml).map_err(|e| StoreError::parse(&self.path, e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub article: CompactString,
    pub revisions: usize,
    pub first: Option<YearMonth>,
    pub last: Option<YearMonth>,
}

impl Display for StoreSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.first, self.last) {
            (Some(first), Some(last)) => write!(
                f,
                "{} revisions stored for {} from {} to {}",
                self.revisions, self.article, first, last
            ),
            _ => write!(f, "no revisions stored for {}", self.article),
        }
    }
}

/// Order revision ids numerically when both are numbers, otherwise lexicographically.
/// Numeric ids sort before non-numeric ones.
pub fn compare_revision_ids(a: &str, b: &str) -> Ordering {
    fn numeric(id: &str) -> Option<&str> {
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .then(|| id.trim_start_matches('0'))
    }

    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x.len().cmp(&y.len()).then_with(|| x.cmp(y)).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn escape_component(component: &str, space_to_underscore: bool) -> String {
    let mut escaped = String::with_capacity(component.len());
    for (i, c) in component.char_indices() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            '.' if i == 0 => escaped.push_str("%2E"),
            ' ' if space_to_underscore => escaped.push('_'),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_component(component: &str) -> String {
    component
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%2E", ".")
        .replace("%25", "%")
}

/// Directory name of an article. Spaces become underscores, as in MediaWiki URLs.
pub fn article_dir_name(article: &str) -> String {
    escape_component(article.trim(), true)
}

fn is_dir(entry: &fs::DirEntry) -> bool {
    entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
}

/// Entries of `dir`, or nothing when it does not exist yet.
fn read_dir_if_present(dir: &Path) -> Result<Vec<fs::DirEntry>, StoreError> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::io(dir)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct RevisionStore {
    root: PathBuf,
}

impl RevisionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn article_dir(&self, article: &str) -> PathBuf {
        self.root.join(article_dir_name(article))
    }

    fn month_dir(&self, article: &str, year_month: YearMonth) -> PathBuf {
        self.article_dir(article)
            .join(format!("{:04}", year_month.year))
            .join(format!("{:02}", year_month.month))
    }

    /// Derive the file of `revision`. Only depends on the article, the id and the timestamp.
    pub fn path_for(&self, article: &str, revision: &Revision) -> PathBuf {
        self.month_dir(article, YearMonth::of(&revision.timestamp))
            .join(format!("{}.{EXTENSION}", escape_component(&revision.id, false)))
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Write `revision` to `path` unless a file is already there. Existing files are never touched.
    pub fn write(&self, path: &Path, revision: &Revision) -> Result<WriteOutcome, StoreError> {
        if self.exists(path) {
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let temp = self.write_temp(path, revision)?;
        let outcome = match fs::hard_link(&temp, path) {
            Ok(()) => Ok(WriteOutcome::Written),
            // lost a race against another writer
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyPresent),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        };
        Self::remove_temp(&temp);

        if let Ok(WriteOutcome::Written) = outcome {
            tracing::debug!(message = "stored revision", revision_id = revision.id.as_str(), path = %path.display());
        }
        outcome
    }

    /// Atomically overwrite whatever is stored at `path`.
    pub fn replace(&self, path: &Path, revision: &Revision) -> Result<(), StoreError> {
        let temp = self.write_temp(path, revision)?;
        if let Err(source) = fs::rename(&temp, path) {
            Self::remove_temp(&temp);
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        tracing::debug!(message = "replaced revision", revision_id = revision.id.as_str(), path = %path.display());
        Ok(())
    }

    fn write_temp(&self, path: &Path, revision: &Revision) -> Result<PathBuf, StoreError> {
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(StoreError::InvalidPath {
                path: path.to_path_buf(),
            });
        };
        fs::create_dir_all(parent).map_err(StoreError::io(parent))?;

        let temp = parent.join(format!(
            ".{}.tmp-{}-{:08x}",
            file_name.to_string_lossy(),
            std::process::id(),
            rand::random::<u32>()
        ));
        let result = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .and_then(|mut file| {
                file.write_all(revision.to_xml().as_bytes())?;
                file.sync_all()
            });
        if let Err(source) = result {
            Self::remove_temp(&temp);
            return Err(StoreError::Io { path: temp, source });
        }
        Ok(temp)
    }

    fn remove_temp(temp: &Path) {
        if let Err(e) = fs::remove_file(temp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(message = "could not remove temporary file", path = %temp.display(), error = %e);
            }
        }
    }

    /// Months that have a directory in the store, oldest first.
    pub fn months(&self, article: &str) -> Result<Vec<YearMonth>, StoreError> {
        let article_dir = self.article_dir(article);
        let mut months = Vec::new();

        for year_entry in read_dir_if_present(&article_dir)? {
            if !is_dir(&year_entry) {
                continue;
            }
            let year_name = year_entry.file_name();
            let year_name = year_name.to_string_lossy();

            for month_entry in read_dir_if_present(&year_entry.path())? {
                if !is_dir(&month_entry) {
                    continue;
                }
                let month_name = month_entry.file_name();
                match YearMonth::parse_dirs(&year_name, &month_name.to_string_lossy()) {
                    Some(year_month) => months.push(year_month),
                    None => tracing::info!(message = "ignoring unexpected directory in store", path = %month_entry.path().display()),
                }
            }
        }

        months.sort_unstable();
        Ok(months)
    }

    /// Revisions stored for one month, ordered by [`compare_revision_ids`].
    pub fn month_revisions(
        &self,
        article: &str,
        year_month: YearMonth,
    ) -> Result<Vec<StoredRevision>, StoreError> {
        let month_dir = self.month_dir(article, year_month);
        let mut revisions = Vec::new();

        for entry in read_dir_if_present(&month_dir)? {
            let path = entry.path();
            let is_revision_file = !is_dir(&entry)
                && path.extension().is_some_and(|ext| ext == EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());

            match stem {
                Some(stem) if is_revision_file && !stem.is_empty() => {
                    revisions.push(StoredRevision {
                        article: CompactString::from(article),
                        year_month,
                        revision_id: CompactString::from(unescape_component(&stem)),
                        path,
                    });
                }
                _ => tracing::debug!(message = "ignoring stray file in store", path = %path.display()),
            }
        }

        revisions.sort_by(|a, b| compare_revision_ids(&a.revision_id, &b.revision_id));
        Ok(revisions)
    }

    /// The month's representative snapshot: the revision with the greatest id.
    pub fn latest_in(
        &self,
        article: &str,
        year_month: YearMonth,
    ) -> Result<Option<StoredRevision>, StoreError> {
        Ok(self.month_revisions(article, year_month)?.pop())
    }

    /// Lazily walk all stored revisions of `article`, month by month.
    ///
    /// Directories are only read when the walk reaches them. After an error the listing ends.
    pub fn list_revisions(&self, article: &str) -> RevisionListing<'_> {
        RevisionListing {
            store: self,
            article: CompactString::from(article),
            months: None,
            current: Vec::new().into_iter(),
            failed: false,
        }
    }

    pub fn summary(&self, article: &str) -> Result<StoreSummary, StoreError> {
        let mut summary = StoreSummary {
            article: CompactString::from(article),
            revisions: 0,
            first: None,
            last: None,
        };

        for year_month in self.months(article)? {
            let count = self.month_revisions(article, year_month)?.len();
            if count > 0 {
                summary.revisions += count;
                summary.first.get_or_insert(year_month);
                summary.last = Some(year_month);
            }
        }

        Ok(summary)
    }

    /// Timestamp of the newest stored revision.
    pub fn latest_timestamp(&self, article: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        for year_month in self.months(article)?.into_iter().rev() {
            let mut latest = None;
            for stored in self.month_revisions(article, year_month)? {
                match stored.load() {
                    Ok(revision) => {
                        latest = latest.max(Some(revision.timestamp));
                    }
                    Err(e) => {
                        tracing::error!(message = "could not read stored revision", path = %stored.path.display(), error = %e);
                        if cfg!(feature = "strict") {
                            return Err(e);
                        }
                        tracing::warn!("Ignoring unreadable revision file");
                    }
                }
            }
            if latest.is_some() {
                return Ok(latest);
            }
        }
        Ok(None)
    }
}

pub struct RevisionListing<'a> {
    store: &'a RevisionStore,
    article: CompactString,
    months: Option<std::vec::IntoIter<YearMonth>>,
    current: std::vec::IntoIter<StoredRevision>,
    failed: bool,
}

impl RevisionListing<'_> {
    fn fail(&mut self, error: StoreError) -> Option<Result<StoredRevision, StoreError>> {
        self.failed = true;
        Some(Err(error))
    }
}

impl Iterator for RevisionListing<'_> {
    type Item = Result<StoredRevision, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(stored) = self.current.next() {
                return Some(Ok(stored));
            }

            if self.months.is_none() {
                match self.store.months(&self.article) {
                    Ok(months) => self.months = Some(months.into_iter()),
                    Err(e) => return self.fail(e),
                }
            }

            let year_month = self.months.as_mut()?.next()?;
            match self.store.month_revisions(&self.article, year_month) {
                Ok(revisions) => self.current = revisions.into_iter(),
                Err(e) => return self.fail(e),
            }
        }
    }
}
