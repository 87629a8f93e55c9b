//! Which headings an article had, at which level, month by month.
//!
//! Each month is sampled once: the stored revision with the greatest id in that month stands for
//! the whole month. Headings are read from the raw markup with the plain heading scanner, without
//! normalization, so a heading is tracked even where the normalizer would have removed the
//! surrounding markup.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use compact_str::CompactString;
use tracing::instrument;

use crate::{
    sections::scan_headings,
    store::{RevisionStore, StoreError, YearMonth},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionEvolution {
    sections: BTreeMap<CompactString, BTreeMap<YearMonth, BTreeSet<u32>>>,
    timeline: BTreeSet<YearMonth>,
}

impl SectionEvolution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample the latest stored revision of every month of `article`.
    ///
    /// A month whose representative revision cannot be parsed is left out of the timeline.
    #[instrument(skip(store))]
    pub fn track(store: &RevisionStore, article: &str) -> Result<Self, StoreError> {
        let mut evolution = Self::new();

        for year_month in store.months(article)? {
            let Some(stored) = store.latest_in(article, year_month)? else {
                continue;
            };
            let revision = match stored.load() {
                Ok(revision) => revision,
                Err(e @ (StoreError::Malformed { .. } | StoreError::Xml { .. })) => {
                    tracing::error!(message = "could not parse representative revision", month = %year_month, path = %stored.path.display(), error = %e);
                    if cfg!(feature = "strict") {
                        return Err(e);
                    }
                    tracing::warn!("Ignoring month without a readable representative revision");
                    continue;
                }
                Err(e) => return Err(e),
            };

            evolution.record(year_month, revision.text.as_str());
        }

        tracing::info!(
            message = "tracked section evolution",
            months = evolution.timeline.len(),
            sections = evolution.sections.len()
        );
        Ok(evolution)
    }

    /// Record the headings of the month's representative body, replacing an earlier sample.
    pub fn record(&mut self, year_month: YearMonth, raw_body: &str) {
        if !self.timeline.insert(year_month) {
            for months in self.sections.values_mut() {
                months.remove(&year_month);
            }
            self.sections.retain(|_, months| !months.is_empty());
        }

        for heading in scan_headings(raw_body) {
            self.sections
                .entry(CompactString::from(heading.name))
                .or_default()
                .entry(year_month)
                .or_default()
                .insert(heading.level);
        }
    }

    /// Sampled months, oldest first. Includes months in which no heading was found.
    pub fn timeline(&self) -> impl Iterator<Item = YearMonth> + '_ {
        self.timeline.iter().copied()
    }

    /// All tracked section names with the levels they had per month.
    pub fn sections(&self) -> &BTreeMap<CompactString, BTreeMap<YearMonth, BTreeSet<u32>>> {
        &self.sections
    }

    pub fn levels(&self, section: &str, year_month: YearMonth) -> Option<&BTreeSet<u32>> {
        self.sections.get(section)?.get(&year_month)
    }

    pub fn report(&self) -> EvolutionReport {
        let columns: Vec<YearMonth> = self.timeline().collect();
        let rows = self
            .sections
            .iter()
            .map(|(section, months)| EvolutionRow {
                section: section.clone(),
                cells: columns
                    .iter()
                    .map(|year_month| months.get(year_month).map(join_levels).unwrap_or_default())
                    .collect(),
            })
            .collect();

        EvolutionReport { columns, rows }
    }

    /// For every sampled year, the sorted names of sections that appeared at `level` in any of
    /// its months. Years in which no section had that level map to an empty list.
    pub fn sections_by_year(&self, level: u32) -> BTreeMap<i32, Vec<CompactString>> {
        let mut by_year: BTreeMap<i32, Vec<CompactString>> = self
            .timeline()
            .map(|year_month| (year_month.year, Vec::new()))
            .collect();

        for (section, months) in &self.sections {
            let years: BTreeSet<i32> = months
                .iter()
                .filter(|(_, levels)| levels.contains(&level))
                .map(|(year_month, _)| year_month.year)
                .collect();
            for year in years {
                by_year.entry(year).or_default().push(section.clone());
            }
        }

        by_year
    }
}

fn join_levels(levels: &BTreeSet<u32>) -> String {
    levels
        .iter()
        .map(|level| level.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolutionRow {
    pub section: CompactString,
    /// One cell per report column: the comma-joined levels, empty if the section was absent.
    pub cells: Vec<String>,
}

/// Sparse section x month table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolutionReport {
    pub columns: Vec<YearMonth>,
    pub rows: Vec<EvolutionRow>,
}

impl Display for EvolutionReport {
    /// Tab-separated, one header line followed by one line per section.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "section")?;
        for column in &self.columns {
            write!(f, "\t{column}")?;
        }
        writeln!(f)?;

        for row in &self.rows {
            write!(f, "{}", row.section)?;
            for cell in &row.cells {
                write!(f, "\t{cell}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
