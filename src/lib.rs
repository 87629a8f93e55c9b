// SPDX-License-Identifier: MPL-2.0
//! # wikicorpus
//!
//! Incrementally download the revision history of a Wikipedia article and turn it into a cleaned,
//! section-segmented text corpus.
//!
//! ## Overview
//!
//! `wikicorpus` covers the whole path from the MediaWiki API to analysis-ready text:
//!
//! - **Fetching**: revisions are requested page by page through the API's continuation cursors,
//!   starting at a date watermark, and arrive in ascending timestamp order.
//! - **Storing**: every revision becomes one small XML file under
//!   `<root>/<article>/<YYYY>/<MM>/<revision id>.xml`. Files are never overwritten unless asked
//!   for, so an interrupted download can simply be run again.
//! - **Normalizing**: wiki markup (templates, references, tables, file embeds, tags, links) is
//!   stripped by an ordered cascade of rewrite rules.
//! - **Segmenting**: the cleaned text is split at its `== Heading ==` lines into named, levelled
//!   sections.
//! - **Assembling**: one record per non-empty section of every stored revision, with the
//!   revision's metadata, ready to be written as JSON lines.
//! - **Tracking**: which headings an article had, at which level, month by month.
//!
//! ## Getting Started
//!
//! ### Downloading a History
//!
//! ```rust,no_run
//! use wikicorpus::api::MediaWikiClient;
//! use wikicorpus::fetcher::{parse_watermark, sync_article, SyncOptions};
//! use wikicorpus::store::RevisionStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MediaWikiClient::from_env()?;
//!     let store = RevisionStore::new("data");
//!     let options = SyncOptions {
//!         since: parse_watermark("2023-01-01").ok_or("invalid date")?,
//!         force_refresh: false,
//!     };
//!
//!     let report = sync_article(client, &store, "Xi Jinping", &options)?;
//!     println!("{report}");
//!     println!("{}", store.summary("Xi Jinping")?);
//!     Ok(())
//! }
//! ```
//!
//! ### Building the Corpus
//!
//! ```rust,no_run
//! use wikicorpus::corpus::assemble;
//! use wikicorpus::store::RevisionStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RevisionStore::new("data");
//!     for record in assemble(&store, "Xi Jinping") {
//!         println!("{}", serde_json::to_string(&record?)?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Section Evolution
//!
//! ```rust,no_run
//! use wikicorpus::evolution::SectionEvolution;
//! use wikicorpus::store::RevisionStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RevisionStore::new("data");
//!     let evolution = SectionEvolution::track(&store, "Xi Jinping")?;
//!
//!     // tab-separated section x month table
//!     print!("{}", evolution.report());
//!
//!     for (year, sections) in evolution.sections_by_year(2) {
//!         let names: Vec<&str> = sections.iter().map(|s| s.as_str()).collect();
//!         println!("{year}: {}", names.join(", "));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! ### `api` Module
//!
//! **Purpose**: Talks to the MediaWiki action API.
//!
//! - [`api::RevisionApi`] is the one-page-per-call pagination contract. Implement it to feed the
//!   fetcher from another source.
//! - [`api::MediaWikiClient`] implements it over blocking HTTP with timeouts, request spacing and
//!   retries with exponential backoff. [`api::ClientConfig::from_env`] reads the
//!   `WIKICORPUS_*` environment variables.
//!
//! ### `fetcher` Module
//!
//! **Purpose**: Incremental download.
//!
//! - [`fetcher::fetch_since`] is a lazy iterator of revisions with non-decreasing timestamps.
//! - [`fetcher::sync_article`] stores everything it yields and reports what was saved or skipped.
//!
//! ### `store` Module
//!
//! **Purpose**: The on-disk revision archive: atomic writes, month listings, summaries.
//!
//! ### `markup`, `sections` and `corpus` Modules
//!
//! **Purpose**: From a raw revision body to corpus records.
//!
//! ```rust
//! use wikicorpus::markup::normalize;
//! use wikicorpus::sections::segment;
//!
//! let text = normalize("Lead{{Infobox|x=1}}.<ref>Source</ref>\n== History ==\nSee [[Beijing|the capital]].");
//! let sections = segment(&text);
//! assert_eq!(sections[0].name, "Introduction");
//! assert_eq!(sections[0].body, "Lead.");
//! assert_eq!(sections[1].name, "History");
//! assert_eq!(sections[1].body, "See the capital.");
//! ```
//!
//! The normalizer is data driven: [`markup::DEFAULT_RULES`] can be extended or replaced through
//! [`markup::Normalizer::with_rules`], and rules can be deserialized with `serde`.
//!
//! ### `evolution` Module
//!
//! **Purpose**: Month by month heading history. Each month is represented by its stored revision
//! with the greatest id.
//!
//! ## Features and Configuration
//!
//! ### Logging and Error Handling
//!
//! - Uses the `tracing` crate for logging warnings and errors.
//! - Unparsable revisions (from the API or from disk) are logged and skipped. Enable the `strict`
//!   feature to turn them into errors instead.
//!
//! ```toml
//! [dependencies]
//! wikicorpus = { version = "0.1.0", features = ["strict"] }
//! ```
//!
//! ## Limitations
//!
//! - **Best-effort normalization**: malformed markup (unbalanced braces, unclosed tags) may leave
//!   stray punctuation behind.
//! - **Single article per run**: the fetcher works on one article at a time and makes one request
//!   at a time.
//!
//! ## Dependencies
//!
//! - **`compact_str`**: Used in the public API for short strings (article titles, revision ids,
//!   contributor names, section names).
//! - **`chrono`**: Timestamps in the public API are `DateTime<Utc>`.

pub mod api;
pub mod corpus;
pub mod evolution;
pub mod fetcher;
pub mod markup;
pub mod revision;
pub mod sections;
pub mod store;
#[cfg(test)]
mod test_support;
mod utils;
