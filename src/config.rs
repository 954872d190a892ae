//! Pipeline configuration.
//!
//! Settings are persisted as JSON at `<config dir>/rustalex/config.json`.
//! A missing file means defaults; every field is optional in the file.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// OpenAlex API base URL
pub const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// Maximum results per page (OpenAlex limit)
pub const MAX_PER_PAGE: u32 = 200;

/// Default config file path: `<config dir>/rustalex/config.json`
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join("rustalex").join("config.json"))
        .ok_or_else(|| PipelineError::Config("Cannot determine config directory".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// API root, without trailing slash
    pub api_base: String,
    /// Results per page, 1..=200
    pub per_page: u32,
    /// Timeout for a single page request
    pub request_timeout_secs: u64,
    /// Retries per page after the first attempt
    pub max_retries: u32,
    /// First backoff delay; doubled on every retry
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay
    pub backoff_max_ms: u64,
    /// Stop after this many pages (None = until end of results)
    pub max_pages: Option<usize>,
    /// Root folder for per-search output folders
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: OPENALEX_API_BASE.to_string(),
            per_page: MAX_PER_PAGE,
            request_timeout_secs: 30,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_pages: None,
            output_dir: PathBuf::from("./output"),
        }
    }
}

impl PipelineConfig {
    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!(path = ?path, "Loaded config");
        Ok(config)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = ?path, "Saved config");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_page == 0 || self.per_page > MAX_PER_PAGE {
            return Err(PipelineError::Config(format!(
                "per_page must be between 1 and {}, got {}",
                MAX_PER_PAGE, self.per_page
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(PipelineError::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(PipelineError::Config(
                "backoff_base_ms cannot exceed backoff_max_ms".to_string(),
            ));
        }
        if url::Url::parse(&self.api_base).is_err() {
            return Err(PipelineError::Config(format!("invalid api_base: {}", self.api_base)));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
