//! rustalex - OpenAlex Acquisition and Refinement Pipeline
//!
//! Builds an OpenAlex query from keyword groups, crawls every result page
//! into an append-only JSONL log and refines it into a fixed-schema table.
//!
//! ## Usage
//!
//! ### CLI Mode
//! ```bash
//! rustalex search --and neuromorphic --or 'MRAM, "spin-orbit torque"' --email you@example.org
//! rustalex resume output/20250101_120000_neuromorphic_MRAM
//! ```
//!
//! ### HTTP Server Mode
//! ```bash
//! rustalex serve --port 3000
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, Local};
use clap::{Parser, Subcommand};
use rustalex::config::default_config_path;
use rustalex::pipeline::TABLE_FILE;
use rustalex::query::parse_keywords;
use rustalex::refine::refine_file;
use rustalex::{
    CancelFlag, DocumentType, NormalizedRecord, Pipeline, PipelineConfig, PipelineError, PipelineRun,
    Progress, RecordTable, Recovery, RunOptions, SearchCriteria, SearchFolder, SearchMode, COLUMNS,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// OpenAlex Acquisition and Refinement Pipeline
#[derive(Parser)]
#[command(name = "rustalex")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (default: <config dir>/rustalex/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search OpenAlex, collect every page and refine the records
    Search {
        /// Keywords of which at least one must match (comma-separated, quote phrases)
        #[arg(long = "or", default_value = "")]
        or_keywords: String,

        /// Keywords that must all match (comma-separated, quote phrases)
        #[arg(long = "and", default_value = "")]
        and_keywords: String,

        /// First publication year (default: current year - 5)
        #[arg(long)]
        from: Option<i32>,

        /// Last publication year (default: current year)
        #[arg(long)]
        to: Option<i32>,

        /// Document types, comma-separated; empty for all types
        #[arg(long, default_value = "article")]
        types: String,

        /// Query construction: broad or precise
        #[arg(long, default_value = "precise", value_parser = ["broad", "precise"])]
        mode: String,

        /// Contact email sent to OpenAlex
        #[arg(long)]
        email: String,

        /// Output directory (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many pages (overrides config)
        #[arg(long)]
        max_pages: Option<usize>,

        /// Refine the pages already collected if the fetch is interrupted
        #[arg(long)]
        salvage: bool,
    },

    /// Continue an interrupted search from its last committed page
    Resume {
        /// Search folder created by `search`
        folder: PathBuf,

        /// Refine the pages already collected if the fetch is interrupted again
        #[arg(long)]
        salvage: bool,
    },

    /// Refine an existing record log into a table
    Refine {
        /// JSONL record log
        log: PathBuf,

        /// Output table, `.xlsx` or `.csv` (default: refined_data.xlsx next to the log)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a refined table and print summary statistics
    Inspect {
        /// Refined table (`.xlsx` or `.csv`)
        table: PathBuf,

        /// Number of keywords to list
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Run as HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show config file path
    Path,
    /// Print the effective config
    Show,
    /// Write a default config file if none exists
    Init,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if cli.json_logs {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Search {
            or_keywords,
            and_keywords,
            from,
            to,
            types,
            mode,
            email,
            output,
            max_pages,
            salvage,
        } => {
            let mut config = PipelineConfig::load(&config_path)?;
            if let Some(output) = output {
                config.output_dir = output;
            }
            if max_pages.is_some() {
                config.max_pages = max_pages;
            }

            let current_year = Local::now().year();
            let criteria = SearchCriteria {
                or_keywords: parse_keywords(&or_keywords),
                and_keywords: parse_keywords(&and_keywords),
                start_year: from.unwrap_or(current_year - 5),
                end_year: to.unwrap_or(current_year),
                document_types: parse_types(&types)?,
                mode: mode.parse::<SearchMode>()?,
                email,
            };
            run_search(config, criteria, salvage).await
        }
        Commands::Resume { folder, salvage } => {
            let config = PipelineConfig::load(&config_path)?;
            run_resume(config, &folder, salvage).await
        }
        Commands::Refine { log, output } => run_refine(&log, output),
        Commands::Inspect { table, top } => run_inspect(&table, top),
        Commands::Serve { port, host } => {
            let config = PipelineConfig::load(&config_path)?;
            run_server(config, host, port).await
        }
        Commands::Config { action } => handle_config(action, &config_path),
    }
}

fn parse_types(types: &str) -> Result<Vec<DocumentType>> {
    let parsed = types
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::parse::<DocumentType>)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(parsed)
}

// ============================================================================
// Search Pipeline
// ============================================================================

async fn run_search(config: PipelineConfig, criteria: SearchCriteria, salvage: bool) -> Result<()> {
    let folder = SearchFolder::create(&config.output_dir, &criteria)?;
    println!("Output folder: {}", folder.path().display());

    let options = RunOptions::new(folder.records_path()).salvage_partial(salvage);
    run_in_folder(config, &criteria, &folder, options).await
}

async fn run_resume(config: PipelineConfig, path: &Path, salvage: bool) -> Result<()> {
    let (folder, criteria) = SearchFolder::open(path)?;
    println!("Resuming search in: {}", folder.path().display());

    let options = RunOptions::new(folder.records_path())
        .resume(true)
        .salvage_partial(salvage);
    run_in_folder(config, &criteria, &folder, options).await
}

async fn run_in_folder(
    config: PipelineConfig,
    criteria: &SearchCriteria,
    folder: &SearchFolder,
    options: RunOptions,
) -> Result<()> {
    let pipeline = Pipeline::new(config)?;

    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling after the current page...");
            trigger.cancel();
        }
    });

    let mut fetching = false;
    let result = pipeline
        .run(criteria, &options, &cancel, |p| print_progress(p, &mut fetching))
        .await;

    let run = match result {
        Ok(run) => run,
        Err(e) => {
            report_failure(&e, folder);
            return Err(e).context("Search failed");
        }
    };

    run.table.save(&folder.table_path())?;
    println!("Saved: {:?}", folder.table_path());
    print_run_summary(&run);

    if let Some(e) = &run.interruption {
        println!("\n⚠ Fetch interrupted, table covers committed pages only.");
        report_failure(e, folder);
    } else if !run.is_complete() {
        println!("\nFetch stopped early. Continue with: rustalex resume {}", folder.path().display());
    }

    println!("\n✓ Pipeline complete. Results in: {}", folder.path().display());
    Ok(())
}

fn print_progress(progress: Progress, fetching: &mut bool) {
    match progress {
        Progress::BuildingQuery => println!("\n--- Stage 1: Building Query ---"),
        Progress::QueryReady { url } => println!("Request: {}", url),
        Progress::FetchingPage { page, records_so_far } => {
            if !*fetching {
                *fetching = true;
                println!("\n--- Stage 2: Fetching from OpenAlex ---");
            }
            debug!(page = page, records = records_so_far, "Requesting page");
        }
        Progress::Retrying { page, attempt, delay } => {
            println!("  Page {} failed, retry {} in {:.1}s", page, attempt, delay.as_secs_f64());
        }
        Progress::PagePersisted { page, records, total_records } => {
            println!("  Page {}: {} records (total {})", page, records, total_records);
        }
        Progress::Refining { .. } => println!("\n--- Stage 3: Refining Records ---"),
        Progress::Finished { rows } => println!("Refined {} records.", rows),
    }
}

fn print_run_summary(run: &PipelineRun) {
    if let Some(fetch) = &run.fetch {
        println!(
            "Fetched {} page(s), {} record(s) this run; {} record(s) in log.",
            fetch.pages_fetched, fetch.records_fetched, fetch.total_records
        );
        if let Some(count) = fetch.reported_count {
            println!("OpenAlex reported {} matching works.", count);
        }
    }
    if run.refine.malformed_lines > 0 || run.refine.records_with_issues > 0 {
        println!(
            "Skipped {} malformed line(s); {} record(s) had unexpected fields.",
            run.refine.malformed_lines, run.refine.records_with_issues
        );
    }
}

fn recovery_hint(e: &PipelineError) -> &'static str {
    match e.recovery() {
        Recovery::Retry => "Fix the input or try again.",
        Recovery::Salvage => "Collected pages are kept; resume or refine them.",
        Recovery::Unusable => "The input or response cannot be used.",
    }
}

fn report_failure(e: &PipelineError, folder: &SearchFolder) {
    error!(error = %e, "Search failed");
    println!("{}", recovery_hint(e));
    if let PipelineError::Interrupted { retryable, .. } = e {
        if *retryable {
            println!("Resume with: rustalex resume {}", folder.path().display());
        }
        println!("Or refine what was collected: rustalex refine {}", folder.records_path().display());
    }
}

// ============================================================================
// Refine / Inspect
// ============================================================================

fn run_refine(log: &Path, output: Option<PathBuf>) -> Result<()> {
    let (table, report) = refine_file(log).context("Failed to refine record log")?;
    let output = output.unwrap_or_else(|| log.with_file_name(TABLE_FILE));

    table.save(&output)?;
    println!("Saved: {:?}", output);
    println!(
        "Read {} line(s): {} row(s), {} malformed, {} with unexpected fields.",
        report.lines, report.rows, report.malformed_lines, report.records_with_issues
    );
    Ok(())
}

fn run_inspect(path: &Path, top: usize) -> Result<()> {
    let table = RecordTable::load(path).context("Table does not match the expected schema")?;
    let summary = table.summary(top);

    println!("Rows: {}", summary.rows);
    match (summary.first_year, summary.last_year) {
        (Some(first), Some(last)) => println!("Years: {}-{}", first, last),
        _ => println!("Years: n/a"),
    }
    println!("Citations: {}", summary.total_citations);
    println!("Distinct authors: {}", summary.distinct_authors);
    println!("Distinct institutions: {}", summary.distinct_institutions);
    println!("Distinct countries: {}", summary.distinct_countries);
    if !summary.top_keywords.is_empty() {
        println!("Top keywords:");
        for (keyword, count) in &summary.top_keywords {
            println!("  {:>5}  {}", count, keyword);
        }
    }
    Ok(())
}

// ============================================================================
// HTTP Server
// ============================================================================

async fn run_server(config: PipelineConfig, host: String, port: u16) -> Result<()> {
    info!(host = %host, port = port, "Starting HTTP server");
    println!("Starting server at http://{}:{}", host, port);

    let app_state = Arc::new(AppState {
        config,
        busy: Mutex::new(()),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/columns", get(columns_handler))
        .route("/search", post(search_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid host:port")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

struct AppState {
    config: PipelineConfig,
    /// Held while a search runs; one search at a time
    busy: Mutex<()>,
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

async fn columns_handler() -> Json<&'static [&'static str]> {
    Json(COLUMNS)
}

/// Search request body
#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(flatten)]
    criteria: SearchCriteria,
    /// Return the committed pages if the fetch is interrupted
    #[serde(default)]
    salvage: bool,
}

/// Search response
#[derive(Debug, Serialize)]
struct SearchResponse {
    status: String,
    folder: Option<PathBuf>,
    complete: bool,
    count: usize,
    columns: &'static [&'static str],
    records: Vec<NormalizedRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

impl SearchResponse {
    fn failure(e: &PipelineError, folder: Option<PathBuf>) -> Self {
        Self {
            status: "error".to_string(),
            folder,
            complete: false,
            count: 0,
            columns: COLUMNS,
            records: vec![],
            error: Some(e.to_string()),
            hint: Some(recovery_hint(e)),
        }
    }
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::Validation(_) | PipelineError::Schema(_) => StatusCode::BAD_REQUEST,
        PipelineError::Interrupted { .. }
        | PipelineError::Network(_)
        | PipelineError::BodyInterrupted(_)
        | PipelineError::RateLimited(_)
        | PipelineError::Api { .. }
        | PipelineError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Search endpoint handler
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> (StatusCode, Json<SearchResponse>) {
    let Ok(_guard) = state.busy.try_lock() else {
        let busy = PipelineError::Validation("another search is already running".to_string());
        return (StatusCode::CONFLICT, Json(SearchResponse::failure(&busy, None)));
    };
    info!(
        or = ?req.criteria.or_keywords,
        and = ?req.criteria.and_keywords,
        mode = ?req.criteria.mode,
        "Search request"
    );

    let folder = match SearchFolder::create(&state.config.output_dir, &req.criteria) {
        Ok(folder) => folder,
        Err(e) => return (status_for(&e), Json(SearchResponse::failure(&e, None))),
    };
    let folder_path = Some(folder.path().to_path_buf());

    let result = async {
        let pipeline = Pipeline::new(state.config.clone())?;
        let options = RunOptions::new(folder.records_path()).salvage_partial(req.salvage);
        let run = pipeline
            .run(&req.criteria, &options, &CancelFlag::new(), |p| debug!(progress = ?p, "Search progress"))
            .await?;
        run.table.save(&folder.table_path())?;
        Ok::<_, PipelineError>(run)
    }
    .await;

    match result {
        Ok(run) => {
            let complete = run.is_complete();
            let error = run.interruption.as_ref().map(|e| e.to_string());
            let hint = run.interruption.as_ref().map(recovery_hint);
            let records = run.table.into_rows();
            (
                StatusCode::OK,
                Json(SearchResponse {
                    status: if complete { "success" } else { "partial" }.to_string(),
                    folder: folder_path,
                    complete,
                    count: records.len(),
                    columns: COLUMNS,
                    records,
                    error,
                    hint,
                }),
            )
        }
        Err(e) => {
            error!(error = %e, "Search failed");
            (status_for(&e), Json(SearchResponse::failure(&e, folder_path)))
        }
    }
}

// ============================================================================
// Config Management
// ============================================================================

fn handle_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("Config file: {:?}", path);
        }
        ConfigAction::Show => {
            let config = PipelineConfig::load(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Init => {
            if path.exists() {
                println!("Config file already exists: {:?}", path);
            } else {
                PipelineConfig::default().save(path)?;
                println!("Wrote default config to {:?}", path);
            }
        }
    }
    Ok(())
}
