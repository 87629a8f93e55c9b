use std::{
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use wikicorpus::{
    api::MediaWikiClient,
    corpus::{assemble, load_or_skip, revision_sections},
    evolution::SectionEvolution,
    fetcher::{parse_watermark, sync_article, SyncOptions},
    markup::default_normalizer,
    revision::format_timestamp,
    sections::render_sections,
    store::RevisionStore,
};

/// Oldest possible watermark, used when nothing is stored yet.
const EPOCH: &str = "2001-01-01";

#[derive(Parser)]
#[command(name = "wikicorpus", about = "Wikipedia revision history to section corpus")]
struct Cli {
    /// Root of the revision store
    #[arg(long, env = "WIKICORPUS_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download new revisions of an article into the store
    Fetch {
        article: String,
        /// Watermark (YYYY-MM-DD or full timestamp); default: resume from the newest stored revision
        #[arg(long)]
        since: Option<String>,
        /// Overwrite revisions that are already stored
        #[arg(long)]
        force_refresh: bool,
    },
    /// Write the section corpus of all stored revisions to stdout
    Corpus {
        article: String,
        #[arg(long, value_enum, default_value_t = CorpusFormat::Json)]
        format: CorpusFormat,
    },
    /// Show which sections existed in which month
    Evolution {
        article: String,
        /// List section names per year at this heading level instead of the monthly table
        #[arg(long)]
        level: Option<u32>,
    },
    /// Show what is stored for an article
    Summary { article: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum CorpusFormat {
    /// One JSON object per section
    Json,
    /// Cleaned text per revision with section banners
    Text,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let store = RevisionStore::new(&cli.data_dir);

    match cli.command {
        Commands::Fetch {
            article,
            since,
            force_refresh,
        } => {
            let since = resolve_since(&store, &article, since.as_deref())?;
            let client = MediaWikiClient::from_env().context("could not set up HTTP client")?;
            tracing::info!(message = "fetching revisions", article = article.as_str(), since = %since, api = client.config().api_url.as_str());

            let options = SyncOptions {
                since,
                force_refresh,
            };
            let report = sync_article(client, &store, &article, &options).with_context(|| {
                format!("sync of {article:?} did not complete, run again to resume")
            })?;
            println!("{report}");
            println!("{}", store.summary(&article)?);
        }
        Commands::Corpus { article, format } => {
            let mut out = BufWriter::new(io::stdout().lock());
            match format {
                CorpusFormat::Json => write_records(&store, &article, &mut out)?,
                CorpusFormat::Text => write_texts(&store, &article, &mut out)?,
            }
            out.flush()?;
        }
        Commands::Evolution { article, level } => {
            let evolution = SectionEvolution::track(&store, &article)
                .with_context(|| format!("could not read stored revisions of {article:?}"))?;
            let mut out = BufWriter::new(io::stdout().lock());
            match level {
                None => write!(out, "{}", evolution.report())?,
                Some(level) => {
                    for (year, sections) in evolution.sections_by_year(level) {
                        let names: Vec<&str> = sections.iter().map(|s| s.as_str()).collect();
                        writeln!(out, "{year}\t{}", names.join(", "))?;
                    }
                }
            }
            out.flush()?;
        }
        Commands::Summary { article } => {
            println!("{}", store.summary(&article)?);
        }
    }

    Ok(())
}

fn resolve_since(
    store: &RevisionStore,
    article: &str,
    since: Option<&str>,
) -> Result<DateTime<Utc>> {
    if let Some(since) = since {
        return parse_watermark(since).ok_or_else(|| anyhow!("invalid --since value {since:?}"));
    }
    match store.latest_timestamp(article)? {
        Some(latest) => Ok(latest),
        None => parse_watermark(EPOCH).ok_or_else(|| anyhow!("invalid default watermark")),
    }
}

fn write_records(store: &RevisionStore, article: &str, out: &mut impl Write) -> Result<()> {
    let mut assembler = assemble(store, article);
    let mut records = 0usize;
    for record in assembler.by_ref() {
        let record =
            record.with_context(|| format!("could not read stored revisions of {article:?}"))?;
        serde_json::to_writer(&mut *out, &record)?;
        writeln!(out)?;
        records += 1;
    }
    tracing::info!(
        message = "corpus written",
        records,
        revisions = assembler.revisions(),
        skipped = assembler.skipped()
    );
    Ok(())
}

fn write_texts(store: &RevisionStore, article: &str, out: &mut impl Write) -> Result<()> {
    for stored in store.list_revisions(article) {
        let stored = stored?;
        let Some(revision) = load_or_skip(&stored)? else {
            continue;
        };
        let sections = revision_sections(&revision, default_normalizer());
        writeln!(out, "# {} {}", revision.id, format_timestamp(&revision.timestamp))?;
        writeln!(out, "{}", render_sections(&sections))?;
    }
    Ok(())
}
