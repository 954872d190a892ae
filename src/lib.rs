//! # rustalex
//!
//! OpenAlex acquisition and refinement pipeline.
//!
//! ## Modules
//!
//! - [`query`] - Search criteria and OpenAlex filter construction
//! - [`fetcher`] - Cursor pagination with retry and backoff
//! - [`store`] - Append-only JSONL record log with checkpoints
//! - [`refine`] - Flattening raw works into table rows
//! - [`table`] - The normalized table and its workbook and CSV forms
//! - [`pipeline`] - Orchestration and per-search folders
//! - [`config`] - Persisted settings
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustalex::{CancelFlag, Pipeline, PipelineConfig, RunOptions, SearchCriteria, SearchFolder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let criteria = SearchCriteria {
//!         or_keywords: vec!["MRAM".into()],
//!         and_keywords: vec!["neuromorphic".into()],
//!         start_year: 2015,
//!         end_year: 2020,
//!         document_types: vec![],
//!         mode: Default::default(),
//!         email: "you@example.org".into(),
//!     };
//!     let config = PipelineConfig::default();
//!     let folder = SearchFolder::create(&config.output_dir, &criteria)?;
//!     let pipeline = Pipeline::new(config)?;
//!     let run = pipeline
//!         .run(&criteria, &RunOptions::new(folder.records_path()), &CancelFlag::new(), |_| {})
//!         .await?;
//!     println!("Refined {} records", run.table.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod query;
pub mod refine;
pub mod store;
pub mod table;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use error::{PipelineError, Recovery, Result};
pub use fetcher::{CancelFlag, FetchSummary, Fetcher, RetryPolicy, StopReason};
pub use pipeline::{Pipeline, PipelineRun, Progress, RunOptions, SearchFolder};
pub use query::{DocumentType, Query, SearchCriteria, SearchMode};
pub use refine::RefineReport;
pub use table::{NormalizedRecord, RecordTable, COLUMNS};
