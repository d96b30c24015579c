//! paperfunnel - arXiv literature funnel
//!
//! Searches arXiv for a research topic, screens each hit with an LLM,
//! downloads the relevant PDFs and deep-analyzes them into a structured
//! report. Every verdict lands in SQLite, so interrupted runs resume and
//! repeat topics skip already-seen papers.
//!
//! ## Usage
//!
//! ### Run the funnel
//! ```bash
//! paperfunnel run "sparse attention for long documents" --max-analysis 5
//! ```
//!
//! ### Inspect and export
//! ```bash
//! paperfunnel stats --session-id 3
//! paperfunnel export --session-id 3 -o ./papers_output
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paperfunnel::arxiv::ArxivClient;
use paperfunnel::oracle::{Oracle, OracleClient, OracleConfig};
use paperfunnel::pdf::DocumentStore;
use paperfunnel::pipeline::{FunnelConfig, Pipeline, RunOptions, RunReport};
use paperfunnel::report;
use paperfunnel::retry::RetryPolicy;
use paperfunnel::store::{PaperStatus, Scope, Session, Store};
use paperfunnel::ResearchError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// arXiv literature funnel - search, screen, download and deep-analyze papers
#[derive(Parser)]
#[command(name = "paperfunnel")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the research funnel for a topic
    Run {
        /// Research topic
        topic: String,

        /// Explicit search keyword (repeatable; disables keyword suggestion)
        #[arg(short = 'k', long = "keyword")]
        keywords: Vec<String>,

        /// Search with the topic verbatim instead of LLM-suggested keywords
        #[arg(long)]
        no_auto_keywords: bool,

        /// Maximum search results to examine
        #[arg(long, default_value_t = 50)]
        max_search: usize,

        /// Maximum papers to download and deep-analyze
        #[arg(long, default_value_t = 10)]
        max_analysis: usize,

        /// Minimum relevance score (0-100) for the analysis shortlist
        #[arg(long, default_value_t = 60.0)]
        relevance_threshold: f64,

        /// Skip the search stage
        #[arg(long)]
        skip_search: bool,

        /// Skip the screening stage
        #[arg(long)]
        skip_screening: bool,

        /// Skip the download stage
        #[arg(long)]
        skip_download: bool,

        /// Skip the analysis stage
        #[arg(long)]
        skip_analysis: bool,

        /// Resume an existing session instead of creating a new one
        #[arg(long)]
        session_id: Option<i64>,

        /// Export the session's results without running any stage
        #[arg(long)]
        export_only: bool,

        /// LLM API base URL
        #[arg(long, default_value = "https://api.openai.com/v1")]
        llm_base_url: String,

        /// LLM API key (falls back to the LLM_API_KEY environment variable)
        #[arg(long)]
        llm_key: Option<String>,

        /// LLM model name
        #[arg(long, default_value = "gpt-4o-mini")]
        llm_model: String,

        /// Data directory for the database and PDFs (default: ~/.paperfunnel)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Output directory for exports
        #[arg(short, long, default_value = "./papers_output")]
        output: PathBuf,
    },

    /// Show paper counts per status, globally or for one session
    Stats {
        /// Session to inspect (omit for global counts)
        #[arg(long)]
        session_id: Option<i64>,

        /// Data directory for the database and PDFs (default: ~/.paperfunnel)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Export a session's analyzed papers to CSV and Markdown
    Export {
        /// Session to export
        #[arg(long)]
        session_id: i64,

        /// Data directory for the database and PDFs (default: ~/.paperfunnel)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Output directory for exports
        #[arg(short, long, default_value = "./papers_output")]
        output: PathBuf,
    },
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

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Run {
            topic,
            keywords,
            no_auto_keywords,
            max_search,
            max_analysis,
            relevance_threshold,
            skip_search,
            skip_screening,
            skip_download,
            skip_analysis,
            session_id,
            export_only,
            llm_base_url,
            llm_key,
            llm_model,
            data_dir,
            output,
        } => {
            run_funnel(
                topic,
                keywords,
                no_auto_keywords,
                max_search,
                max_analysis,
                relevance_threshold,
                RunOptions {
                    skip_search,
                    skip_screening,
                    skip_download,
                    skip_analysis,
                },
                session_id,
                export_only,
                llm_base_url,
                llm_key,
                llm_model,
                data_dir,
                output,
            )
            .await
        }
        Commands::Stats {
            session_id,
            data_dir,
        } => show_stats(session_id, data_dir).await,
        Commands::Export {
            session_id,
            data_dir,
            output,
        } => export_command(session_id, data_dir, output).await,
    }
}

// ============================================================================
// Funnel Run
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_funnel(
    topic: String,
    keywords: Vec<String>,
    no_auto_keywords: bool,
    max_search: usize,
    max_analysis: usize,
    relevance_threshold: f64,
    opts: RunOptions,
    session_id: Option<i64>,
    export_only: bool,
    llm_base_url: String,
    llm_key: Option<String>,
    llm_model: String,
    data_dir: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir)?;
    let store = Store::open(data_dir.join("papers.db"))?;

    // Export-only needs no credentials and runs no stages.
    if export_only {
        let session_id = session_id.context("--export-only requires --session-id")?;
        let (csv_path, report_path) = report::export_session(&store, session_id, &output).await?;
        println!("Exported CSV: {}", csv_path.display());
        println!("Exported report: {}", report_path.display());
        return Ok(());
    }

    let api_key = llm_key
        .or_else(|| std::env::var("LLM_API_KEY").ok())
        .context("No LLM API key: pass --llm-key or set LLM_API_KEY")?;

    let config = FunnelConfig {
        max_search,
        max_analysis,
        relevance_threshold,
        ..FunnelConfig::default()
    };

    let limiter = Arc::new(Semaphore::new(config.concurrency));
    let oracle = Arc::new(OracleClient::new(
        OracleConfig {
            base_url: llm_base_url,
            api_key,
            model: llm_model,
        },
        limiter.clone(),
        RetryPolicy::default(),
    )?);
    let searcher = Arc::new(ArxivClient::new(RetryPolicy::default())?);
    let documents = Arc::new(DocumentStore::new(
        data_dir.join("pdfs"),
        limiter,
        RetryPolicy::default(),
    )?);
    let pipeline = Pipeline::new(
        store.clone(),
        searcher,
        oracle.clone(),
        documents,
        config,
    );

    // Resume an existing session or start a fresh one.
    let (session_id, topic, keywords) = match session_id {
        Some(id) => {
            let session = store
                .session(id)
                .await?
                .with_context(|| format!("No session {id} in the database"))?;
            let keywords = if keywords.is_empty() {
                session.keywords.clone()
            } else {
                keywords
            };
            println!("Resuming session {id}: {}", session.research_topic);
            (id, session.research_topic, keywords)
        }
        None => {
            let keywords = pipeline
                .resolve_keywords(&topic, &keywords, !no_auto_keywords)
                .await;
            let id = store.create_session(&topic, &keywords).await?;
            println!("Session {id}: {topic}");
            (id, topic, keywords)
        }
    };
    println!("Keywords: {}", keywords.join(", "));

    let run_report = pipeline.run(session_id, &topic, &keywords, opts).await?;

    print_run_summary(&run_report);
    let counts = store.status_counts(Scope::Session(session_id)).await?;
    print_status_table(&counts);

    let usage = oracle.usage();
    println!(
        "Token usage: {} prompt + {} completion = {} total across {} calls",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens, usage.api_calls
    );

    match report::export_session(&store, session_id, &output).await {
        Ok((csv_path, report_path)) => {
            println!("\n✓ Run complete. Results in: {}", output.display());
            println!("  CSV:    {}", csv_path.display());
            println!("  Report: {}", report_path.display());
        }
        // Nothing analyzed is a valid outcome, not an error.
        Err(ResearchError::Config(msg)) => {
            println!("\n✓ Run complete. Nothing exported: {msg}");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    println!("\n--- Run Summary ---");
    println!("Discovered: {}", report.discovered);
    println!(
        "Screened relevant: {} (not relevant: {})",
        report.relevant, report.irrelevant
    );
    if report.rank_excluded > 0 {
        println!(
            "Shortlisted: {} ({} cut by rank)",
            report.selected, report.rank_excluded
        );
    } else {
        println!("Shortlisted: {}", report.selected);
    }
    println!(
        "Downloaded: {} (failed: {})",
        report.downloaded, report.download_failed
    );
    println!(
        "Analyzed: {} (failed: {})",
        report.analyzed, report.analysis_failed
    );
}

fn print_status_table(counts: &[(String, i64)]) {
    println!("\n--- Paper Status ---");
    for status in PaperStatus::ALL {
        let count = counts
            .iter()
            .find(|(name, _)| name == status.as_str())
            .map(|(_, n)| *n)
            .unwrap_or(0);
        if count > 0 {
            println!("{:>16}: {}", status.as_str(), count);
        }
    }
}

// ============================================================================
// Stats & Export
// ============================================================================

async fn show_stats(session_id: Option<i64>, data_dir: Option<PathBuf>) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir)?;
    let store = Store::open(data_dir.join("papers.db"))?;

    match session_id {
        Some(id) => {
            let session = store
                .session(id)
                .await?
                .with_context(|| format!("No session {id} in the database"))?;
            print_session(&session);
            let counts = store.status_counts(Scope::Session(id)).await?;
            print_status_table(&counts);
        }
        None => {
            println!("Database: {}", store.path().display());
            let counts = store.status_counts(Scope::Global).await?;
            print_status_table(&counts);
        }
    }
    Ok(())
}

fn print_session(session: &Session) {
    println!("Session {}: {}", session.id, session.research_topic);
    if !session.keywords.is_empty() {
        println!("Keywords: {}", session.keywords.join(", "));
    }
    println!("Created: {}", session.created_at);
    match &session.completed_at {
        Some(ts) => println!("Completed: {ts}"),
        None => println!("Completed: (in progress)"),
    }
    println!(
        "Found {} papers, {} relevant, {} analyzed",
        session.total_found, session.relevant_count, session.analyzed_count
    );
    println!(
        "Token usage: {} prompt + {} completion = {} total across {} calls",
        session.prompt_tokens, session.completion_tokens, session.total_tokens, session.api_calls
    );
}

async fn export_command(
    session_id: i64,
    data_dir: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir)?;
    let store = Store::open(data_dir.join("papers.db"))?;
    let (csv_path, report_path) = report::export_session(&store, session_id, &output).await?;
    println!("Exported CSV: {}", csv_path.display());
    println!("Exported report: {}", report_path.display());
    Ok(())
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = data_dir {
        return Ok(dir);
    }
    let home = dirs::home_dir().context("Could not determine home directory; pass --data-dir")?;
    Ok(home.join(".paperfunnel"))
}
