//! Custom error types for rustalex.
//!
//! This module defines all error types used throughout the pipeline.
//! All functions return `Result<T, PipelineError>` instead of using `unwrap()`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for rustalex operations.
///
/// Uses `thiserror` for ergonomic error handling and automatic `Display` implementation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Search criteria rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The connection failed while the response body was being read
    #[error("Response body interrupted: {0}")]
    BodyInterrupted(#[source] reqwest::Error),

    /// Rate limited by the API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// API returned a non-success status
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// Response body did not match the API contract
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Tabular input does not carry the expected columns
    #[error("Workbook write error: {0}")]
    XlsxWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("Workbook read error: {0}")]
    XlsxRead(#[from] calamine::XlsxError),

    #[error("Schema error: {0}")]
    Schema(String),

    /// The crawl stopped before the end of results. Pages already appended
    /// to `path` remain valid.
    #[error("Fetch interrupted after {pages} page(s), {records} record(s) kept in {path:?}: {cause}")]
    Interrupted {
        pages: usize,
        records: usize,
        path: PathBuf,
        /// True when retries were exhausted on a transient failure
        retryable: bool,
        #[source]
        cause: Box<PipelineError>,
    },
}

/// Result type alias using `PipelineError`
pub type Result<T> = std::result::Result<T, PipelineError>;

/// What the caller can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was created; fix the input or retry with the same inputs.
    Retry,
    /// Part of the crawl is on disk and usable.
    Salvage,
    /// The input or response is structurally unusable.
    Unusable,
}

impl PipelineError {
    /// Whether a single request attempt failing with this error should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            PipelineError::BodyInterrupted(_) | PipelineError::RateLimited(_) => true,
            PipelineError::Api { code, .. } => *code == 408 || *code >= 500,
            _ => false,
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            PipelineError::Interrupted { .. } => Recovery::Salvage,
            PipelineError::Validation(_) => Recovery::Retry,
            e if e.is_transient() => Recovery::Retry,
            _ => Recovery::Unusable,
        }
    }

    /// Records persisted before the crawl stopped, if this is an interruption.
    pub fn salvaged_records(&self) -> Option<usize> {
        match self {
            PipelineError::Interrupted { records, .. } => Some(*records),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a malformed-response message
    fn ok_or_malformed(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| PipelineError::MalformedResponse(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification() {
        assert_eq!(
            PipelineError::Validation("bad email".into()).recovery(),
            Recovery::Retry
        );
        assert_eq!(PipelineError::RateLimited(5).recovery(), Recovery::Retry);
        assert_eq!(
            PipelineError::Api { code: 503, message: "busy".into() }.recovery(),
            Recovery::Retry
        );
        assert_eq!(
            PipelineError::Api { code: 403, message: "forbidden".into() }.recovery(),
            Recovery::Unusable
        );
        assert_eq!(
            PipelineError::MalformedResponse("no results".into()).recovery(),
            Recovery::Unusable
        );

        let interrupted = PipelineError::Interrupted {
            pages: 2,
            records: 400,
            path: PathBuf::from("collected_data.jsonl"),
            retryable: true,
            cause: Box::new(PipelineError::RateLimited(60)),
        };
        assert_eq!(interrupted.recovery(), Recovery::Salvage);
        assert_eq!(interrupted.salvaged_records(), Some(400));
    }
}
