//! Custom error types for paperfunnel.
//!
//! This module defines all error types used throughout the application.
//! All functions return `Result<T, ResearchError>` instead of using `unwrap()`.

use thiserror::Error;

/// Main error type for paperfunnel operations.
///
/// Uses `thiserror` for ergonomic error handling and automatic `Display` implementation.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Feed/JSON/document parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Rate limited by external API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// External API returned an error
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code from API
        code: i32,
        /// Error message from API
        message: String,
    },

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database worker thread is gone or unreachable
    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// Insert would violate the (arxiv_id, session) uniqueness invariant
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// PDF parsing error
    #[error("PDF error: {0}")]
    Pdf(String),

    /// CSV export error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),
}

impl ResearchError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Transient errors are network failures, rate limits and server-side
    /// API errors. Everything else (parse errors, config errors, duplicates)
    /// fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            ResearchError::Network(_) | ResearchError::RateLimited(_) => true,
            ResearchError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Result type alias using `ResearchError`
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| ResearchError::Parse(msg.to_string()))
    }
}
