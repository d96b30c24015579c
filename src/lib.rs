//! # paperfunnel
//!
//! arXiv literature funnel: search, screen, download and deep-analyze papers
//! with an LLM, keeping every verdict in SQLite.
//!
//! ## Modules
//!
//! - [`arxiv`] - arXiv Atom API search client
//! - [`oracle`] - LLM screening, deep analysis and keyword suggestion
//! - [`pdf`] - PDF download and text extraction
//! - [`store`] - SQLite record store for papers and sessions
//! - [`pipeline`] - the funnel orchestrator
//! - [`report`] - CSV and Markdown session exports
//! - [`retry`] - backoff policy for flaky external calls
//! - [`error`] - custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use paperfunnel::arxiv::ArxivClient;
//! use paperfunnel::oracle::{OracleClient, OracleConfig};
//! use paperfunnel::pdf::DocumentStore;
//! use paperfunnel::pipeline::{FunnelConfig, Pipeline, RunOptions};
//! use paperfunnel::retry::RetryPolicy;
//! use paperfunnel::store::Store;
//! use std::sync::Arc;
//! use tokio::sync::Semaphore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Store::open("papers.db".into())?;
//!     let limiter = Arc::new(Semaphore::new(10));
//!     let oracle = Arc::new(OracleClient::new(
//!         OracleConfig {
//!             base_url: "https://api.openai.com/v1".into(),
//!             api_key: "sk-...".into(),
//!             model: "gpt-4o-mini".into(),
//!         },
//!         limiter.clone(),
//!         RetryPolicy::default(),
//!     )?);
//!     let searcher = Arc::new(ArxivClient::new(RetryPolicy::default())?);
//!     let documents = Arc::new(DocumentStore::new(
//!         "pdfs".into(),
//!         limiter,
//!         RetryPolicy::default(),
//!     )?);
//!
//!     let pipeline = Pipeline::new(
//!         store.clone(),
//!         searcher,
//!         oracle,
//!         documents,
//!         FunnelConfig::default(),
//!     );
//!     let topic = "sparse attention";
//!     let keywords = vec![topic.to_string()];
//!     let session = store.create_session(topic, &keywords).await?;
//!     let report = pipeline
//!         .run(session, topic, &keywords, RunOptions::default())
//!         .await?;
//!     println!("analyzed {} papers", report.analyzed);
//!     Ok(())
//! }
//! ```

pub mod arxiv;
pub mod error;
pub mod oracle;
pub mod pdf;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod store;

pub use error::{ResearchError, Result};
