//! Incremental Fetcher
//!
//! Walks OpenAlex cursor pagination one page at a time and commits every page
//! to a [`RecordLog`] before asking for the next one. Memory stays bounded by
//! a single page regardless of result size.
//!
//! API notes (per OpenAlex docs):
//! - `cursor=*` starts a crawl, `meta.next_cursor` continues it, `null` ends it
//! - `mailto` selects the polite pool
//! - 429 responses may carry `Retry-After`

use crate::config::PipelineConfig;
use crate::error::{OptionExt, PipelineError, Result};
use crate::pipeline::Progress;
use crate::query::Query;
use crate::store::{Checkpoint, RecordLog};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries per page after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every wait
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.backoff_base_ms / 4),
        }
    }

    /// Wait before retry number `attempt + 1`. A server-supplied
    /// `Retry-After` raises the wait but never past `max_delay`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let backoff = match retry_after {
            Some(wait) => backoff.max(wait.min(self.max_delay)),
            None => backoff,
        };

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Cooperative cancellation, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a fetch stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `next_cursor` was null
    EndOfResults,
    /// A page came back with no records
    EmptyPage,
    /// The configured page limit was reached
    PageLimit,
    Cancelled,
}

impl StopReason {
    /// Whether the whole result set is in the log.
    pub fn is_complete(&self) -> bool {
        matches!(self, StopReason::EndOfResults | StopReason::EmptyPage)
    }
}

/// Outcome of one fetch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchSummary {
    /// Pages committed during this run
    pub pages_fetched: usize,
    /// Records committed during this run
    pub records_fetched: usize,
    /// Pages in the log, including earlier runs
    pub total_pages: usize,
    /// Records in the log, including earlier runs
    pub total_records: usize,
    /// Total matches reported by the API, when known
    pub reported_count: Option<u64>,
    pub stop: StopReason,
}

impl FetchSummary {
    /// Summary for a log whose last checkpoint already reached the end.
    pub fn already_complete(checkpoint: &Checkpoint) -> Self {
        Self {
            pages_fetched: 0,
            records_fetched: 0,
            total_pages: checkpoint.page,
            total_records: checkpoint.records,
            reported_count: None,
            stop: StopReason::EndOfResults,
        }
    }
}

/// OpenAlex list response
#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    meta: Option<WorksMeta>,
    results: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct WorksMeta {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug)]
struct Page {
    results: Vec<Value>,
    next_cursor: Option<String>,
    count: Option<u64>,
}

fn parse_page(body: &str) -> Result<Page> {
    let response: WorksResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::MalformedResponse(format!("Failed to parse OpenAlex response: {}", e))
    })?;
    let results = response.results.ok_or_malformed("response has no results array")?;
    let (count, next_cursor) = match response.meta {
        Some(meta) => (meta.count, meta.next_cursor),
        None => (None, None),
    };

    Ok(Page {
        results,
        next_cursor: next_cursor.filter(|c| !c.is_empty()),
        count,
    })
}

/// Seconds to wait from a `Retry-After` value: delay-seconds or an HTTP-date.
/// Unparseable values and dates in the past give 0.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> u64 {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return secs;
    }
    DateTime::parse_from_rfc2822(value)
        .map(|at| (at.with_timezone(&Utc) - now).num_seconds().max(0) as u64)
        .unwrap_or(0)
}

fn retry_after(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_retry_after(v, Utc::now()))
        .unwrap_or(0)
}

/// Sequential page fetcher bound to one contact address.
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
    max_pages: Option<usize>,
}

impl Fetcher {
    pub fn new(config: &PipelineConfig, email: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(format!("rustalex/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email))
            .build()?;

        Ok(Self {
            client,
            policy: RetryPolicy::from_config(config),
            max_pages: config.max_pages,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch pages from `query.cursor` onward into `log`.
    ///
    /// Any failure comes back as [`PipelineError::Interrupted`]; the pages
    /// committed before it stay in the log.
    pub async fn fetch(
        &self,
        query: &mut Query,
        log: &mut RecordLog,
        cancel: &CancelFlag,
        progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<FetchSummary> {
        let start_pages = log.pages();
        let start_records = log.records();
        let mut reported_count = None;

        info!(
            filter = %query.filter,
            cursor = %query.cursor,
            pages_in_log = start_pages,
            "Starting OpenAlex fetch"
        );

        let stop = loop {
            if self.max_pages.is_some_and(|max| log.pages() - start_pages >= max) {
                info!(pages = log.pages(), "Page limit reached");
                break StopReason::PageLimit;
            }
            if cancel.is_cancelled() {
                info!(pages = log.pages(), "Fetch cancelled");
                break StopReason::Cancelled;
            }

            let page_number = log.pages() + 1;
            progress(Progress::FetchingPage {
                page: page_number,
                records_so_far: log.records(),
            });

            let page = match self.fetch_page(query, page_number, progress).await {
                Ok(page) => page,
                Err(e) => return Err(interrupted(log, e)),
            };
            if page_number == start_pages + 1 {
                reported_count = page.count;
                if let Some(count) = page.count {
                    info!(count = count, "OpenAlex reports matching works");
                }
            }

            let count = page.results.len();
            let committed = if count == 0 {
                // Commit an empty final page so a resume sees the crawl as done.
                log.append_page(&[], None)
            } else {
                log.append_page(&page.results, page.next_cursor.as_deref())
            };
            if let Err(e) = committed {
                return Err(interrupted(log, e));
            }

            info!(page = page_number, count = count, total = log.records(), "Committed OpenAlex page");
            progress(Progress::PagePersisted {
                page: page_number,
                records: count,
                total_records: log.records(),
            });

            if count == 0 {
                break StopReason::EmptyPage;
            }
            match page.next_cursor {
                Some(cursor) => query.advance(&cursor),
                None => break StopReason::EndOfResults,
            }
        };

        let summary = FetchSummary {
            pages_fetched: log.pages() - start_pages,
            records_fetched: log.records() - start_records,
            total_pages: log.pages(),
            total_records: log.records(),
            reported_count,
            stop,
        };
        info!(
            pages = summary.pages_fetched,
            records = summary.records_fetched,
            stop = ?summary.stop,
            "OpenAlex fetch finished"
        );
        Ok(summary)
    }

    /// One page, retrying transient failures under the policy.
    async fn fetch_page(
        &self,
        query: &Query,
        page: usize,
        progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Page> {
        let url = query.url()?;
        let mut attempt = 0;

        loop {
            debug!(url = %url, page = page, attempt = attempt, "Fetching OpenAlex page");
            match self.request(&url).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let hint = match &e {
                        PipelineError::RateLimited(secs) if *secs > 0 => Some(Duration::from_secs(*secs)),
                        _ => None,
                    };
                    let delay = self.policy.delay(attempt, hint);
                    attempt += 1;
                    warn!(
                        page = page,
                        attempt = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    progress(Progress::Retrying { page, attempt, delay });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request(&self, url: &Url) -> Result<Page> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::RateLimited(retry_after(&response)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(PipelineError::Api {
                code: status.as_u16(),
                message: format!("OpenAlex API error: {} {}", status, detail.trim()),
            });
        }

        // Headers arrived but the connection may still drop mid-body.
        let body = response.text().await.map_err(PipelineError::BodyInterrupted)?;
        parse_page(&body)
    }
}

fn interrupted(log: &RecordLog, cause: PipelineError) -> PipelineError {
    let retryable = cause.is_transient();
    warn!(
        pages = log.pages(),
        records = log.records(),
        retryable = retryable,
        error = %cause,
        "OpenAlex fetch interrupted"
    );
    PipelineError::Interrupted {
        pages: log.pages(),
        records: log.records(),
        path: log.path().to_path_buf(),
        retryable,
        cause: Box::new(cause),
    }
}
