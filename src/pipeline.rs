//! Pipeline orchestrator
//!
//! Query building, fetching and refining for one search, in that order.
//! Each search gets its own folder:
//!
//! ```text
//! output/20250101_120000_neuromorphic_MRAM/
//!   criteria.json
//!   collected_data.jsonl (+ .checkpoints)
//!   refined_data.xlsx
//! ```

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetcher::{CancelFlag, FetchSummary, Fetcher};
use crate::query::{build_query, Query, SearchCriteria};
use crate::refine::{refine_file, RefineReport};
use crate::store::{RecordLog, RECORDS_FILE};
use crate::table::RecordTable;
use chrono::Local;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Criteria of the search that produced a folder
pub const CRITERIA_FILE: &str = "criteria.json";

/// Refined table inside a search folder
pub const TABLE_FILE: &str = "refined_data.xlsx";

/// Stage reports emitted while a search runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    BuildingQuery,
    QueryReady { url: String },
    FetchingPage { page: usize, records_so_far: usize },
    Retrying { page: usize, attempt: u32, delay: Duration },
    PagePersisted { page: usize, records: usize, total_records: usize },
    Refining { path: PathBuf },
    Finished { rows: usize },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Record log to write
    pub destination: PathBuf,
    /// Refine what was committed when the fetch is interrupted
    pub salvage_partial: bool,
    /// Continue from the log's last checkpoint instead of starting fresh
    pub resume: bool,
}

impl RunOptions {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            salvage_partial: false,
            resume: false,
        }
    }

    pub fn salvage_partial(mut self, salvage: bool) -> Self {
        self.salvage_partial = salvage;
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Result of one search.
#[derive(Debug)]
pub struct PipelineRun {
    pub query: Query,
    pub log_path: PathBuf,
    pub table: RecordTable,
    pub refine: RefineReport,
    /// `None` when the fetch was interrupted
    pub fetch: Option<FetchSummary>,
    /// The interruption whose partial log was salvaged
    pub interruption: Option<PipelineError>,
}

impl PipelineRun {
    /// True when the log holds the whole result set.
    pub fn is_complete(&self) -> bool {
        self.fetch.as_ref().is_some_and(|f| f.stop.is_complete())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one search end to end.
    ///
    /// Invalid criteria fail before anything touches the filesystem or the
    /// network. An interrupted fetch is an error unless
    /// `options.salvage_partial` is set, in which case the committed pages
    /// are refined and the interruption is returned alongside the table.
    pub async fn run(
        &self,
        criteria: &SearchCriteria,
        options: &RunOptions,
        cancel: &CancelFlag,
        mut progress: impl FnMut(Progress) + Send,
    ) -> Result<PipelineRun> {
        progress(Progress::BuildingQuery);
        let mut query = build_query(criteria, &self.config)?;
        info!(filter = %query.filter, mode = ?criteria.mode, "Built OpenAlex query");
        progress(Progress::QueryReady {
            url: query.url()?.to_string(),
        });

        let fetcher = Fetcher::new(&self.config, &query.email)?;
        let (mut log, last) = if options.resume {
            RecordLog::resume(&options.destination, &query.filter)?
        } else {
            (RecordLog::create(&options.destination, &query.filter)?, None)
        };

        let fetched = match &last {
            Some(checkpoint) if checkpoint.is_final() => {
                info!(records = checkpoint.records, "Record log already complete");
                Ok(FetchSummary::already_complete(checkpoint))
            }
            _ => {
                if let Some(cursor) = last.as_ref().and_then(|c| c.next_cursor.as_deref()) {
                    query.advance(cursor);
                }
                fetcher.fetch(&mut query, &mut log, cancel, &mut progress).await
            }
        };

        let log_path = log.path().to_path_buf();
        // Release the writer lock before reading the log back.
        drop(log);

        let (fetch, interruption) = match fetched {
            Ok(summary) => (Some(summary), None),
            Err(e @ PipelineError::Interrupted { .. }) if options.salvage_partial => {
                warn!(error = %e, "Salvaging partial record log");
                (None, Some(e))
            }
            Err(e) => return Err(e),
        };

        progress(Progress::Refining { path: log_path.clone() });
        let (table, refine) = refine_file(&log_path)?;
        progress(Progress::Finished { rows: table.len() });

        Ok(PipelineRun {
            query,
            log_path,
            table,
            refine,
            fetch,
            interruption,
        })
    }
}

/// Per-search output folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFolder {
    root: PathBuf,
}

impl SearchFolder {
    /// Create `<output_dir>/<timestamp>_<keywords>/` and record the criteria in it.
    pub fn create(output_dir: &Path, criteria: &SearchCriteria) -> Result<Self> {
        criteria.validate()?;
        std::fs::create_dir_all(output_dir)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = format!("{}_{}", timestamp, folder_slug(criteria));

        let mut suffix = 0;
        let root = loop {
            let name = if suffix == 0 { base.clone() } else { format!("{}-{}", base, suffix) };
            let candidate = output_dir.join(name);
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists && suffix < 100 => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let folder = Self { root };
        std::fs::write(folder.criteria_path(), serde_json::to_string_pretty(criteria)?)?;
        info!(folder = ?folder.root, "Created search folder");
        Ok(folder)
    }

    /// Open an existing search folder and read back its criteria.
    pub fn open(root: &Path) -> Result<(Self, SearchCriteria)> {
        let folder = Self { root: root.to_path_buf() };
        let content = std::fs::read_to_string(folder.criteria_path()).map_err(|e| {
            PipelineError::Validation(format!("{} is not a search folder: {}", root.display(), e))
        })?;
        let criteria: SearchCriteria = serde_json::from_str(&content)?;
        Ok((folder, criteria))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn criteria_path(&self) -> PathBuf {
        self.root.join(CRITERIA_FILE)
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join(RECORDS_FILE)
    }

    pub fn table_path(&self) -> PathBuf {
        self.root.join(TABLE_FILE)
    }
}

fn folder_slug(criteria: &SearchCriteria) -> String {
    let keywords = criteria
        .and_keywords
        .iter()
        .chain(&criteria.or_keywords)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let slug: String = keywords
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    let slug: String = slug.chars().take(40).collect();
    if slug.is_empty() {
        "search".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchMode;
    use crate::table::COLUMNS;
    use crate::test_support::{failure, page, Fixture};
    use axum::http::StatusCode;
    use tempfile::tempdir;

    fn criteria() -> SearchCriteria {
        SearchCriteria {
            or_keywords: vec!["MRAM".to_string()],
            and_keywords: vec!["neuromorphic".to_string()],
            start_year: 2015,
            end_year: 2020,
            document_types: vec![],
            mode: SearchMode::Precise,
            email: "someone@example.org".to_string(),
        }
    }

    fn config(base: &str) -> PipelineConfig {
        PipelineConfig {
            api_base: base.to_string(),
            request_timeout_secs: 5,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_results_still_yield_header() -> Result<()> {
        let server = Fixture::start(|_, _| page(&[], None)).await;
        let dir = tempdir()?;
        let pipeline = Pipeline::new(config(&server.base))?;
        let options = RunOptions::new(dir.path().join(RECORDS_FILE));

        let mut stages = Vec::new();
        let run = pipeline
            .run(&criteria(), &options, &CancelFlag::new(), |p| stages.push(p))
            .await?;

        assert_eq!(server.hits(), 1);
        assert_eq!(
            server.params(0).get("filter").map(String::as_str),
            Some("title_and_abstract.search:neuromorphic AND MRAM,publication_year:2015-2020")
        );
        assert!(run.table.is_empty());
        assert!(run.is_complete());
        assert_eq!(stages.first(), Some(&Progress::BuildingQuery));
        assert_eq!(stages.last(), Some(&Progress::Finished { rows: 0 }));

        let mut out = Vec::new();
        run.table.write_csv(&mut out)?;
        assert_eq!(String::from_utf8_lossy(&out).trim_end(), COLUMNS.join(","));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_criteria_touch_nothing() -> Result<()> {
        let dir = tempdir()?;
        let destination = dir.path().join("out").join(RECORDS_FILE);
        let pipeline = Pipeline::new(config("http://127.0.0.1:9"))?;
        let bad = SearchCriteria {
            start_year: 2021,
            end_year: 2020,
            ..criteria()
        };

        let err = pipeline
            .run(&bad, &RunOptions::new(&destination), &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(!dir.path().join("out").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_salvage_partial() -> Result<()> {
        let script = |_: usize, params: &crate::test_support::Params| match params
            .get("cursor")
            .map(String::as_str)
        {
            Some("*") => page(&["W1", "W2"], Some("c2")),
            _ => failure(StatusCode::FORBIDDEN),
        };
        let server = Fixture::start(script).await;
        let dir = tempdir()?;
        let pipeline = Pipeline::new(config(&server.base))?;

        let strict = RunOptions::new(dir.path().join("strict.jsonl"));
        let err = pipeline
            .run(&criteria(), &strict, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.salvaged_records(), Some(2));

        let salvage = RunOptions::new(dir.path().join("salvage.jsonl")).salvage_partial(true);
        let run = pipeline
            .run(&criteria(), &salvage, &CancelFlag::new(), |_| {})
            .await?;
        assert_eq!(run.table.len(), 2);
        assert!(!run.is_complete());
        assert!(matches!(
            run.interruption,
            Some(PipelineError::Interrupted { retryable: false, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_continues_from_checkpoint() -> Result<()> {
        let healthy = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = healthy.clone();
        let server = Fixture::start(move |_, params| {
            match (params.get("cursor").map(String::as_str), flag.load(std::sync::atomic::Ordering::SeqCst)) {
                (Some("*"), _) => page(&["W1", "W2"], Some("c2")),
                (Some("c2"), true) => page(&["W3"], None),
                _ => failure(StatusCode::SERVICE_UNAVAILABLE),
            }
        })
        .await;
        let dir = tempdir()?;
        let destination = dir.path().join(RECORDS_FILE);
        let pipeline = Pipeline::new(config(&server.base))?;

        let err = pipeline
            .run(&criteria(), &RunOptions::new(&destination), &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted { retryable: true, .. }));

        healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        let resumed = RunOptions::new(&destination).resume(true);
        let run = pipeline
            .run(&criteria(), &resumed, &CancelFlag::new(), |_| {})
            .await?;

        assert_eq!(run.table.len(), 3);
        assert!(run.is_complete());
        assert_eq!(server.cursors().last().map(String::as_str), Some("c2"));
        assert_eq!(server.cursors().iter().filter(|c| *c == "*").count(), 1);

        // A finished log is refined again without new requests.
        let hits = server.hits();
        let again = pipeline
            .run(&criteria(), &resumed, &CancelFlag::new(), |_| {})
            .await?;
        assert_eq!(again.table.len(), 3);
        assert_eq!(server.hits(), hits);
        Ok(())
    }

    #[test]
    fn test_search_folder_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let first = SearchFolder::create(dir.path(), &criteria())?;
        let second = SearchFolder::create(dir.path(), &criteria())?;
        assert_ne!(first.path(), second.path());

        let name = first.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_neuromorphic_MRAM"));

        let (opened, loaded) = SearchFolder::open(first.path())?;
        assert_eq!(opened, first);
        assert_eq!(loaded, criteria());
        assert_eq!(opened.records_path(), first.path().join(RECORDS_FILE));
        Ok(())
    }
}
