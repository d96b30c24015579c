//! PDF retrieval and text extraction.
//!
//! Downloads go to `<dir>/<arxiv_id>.pdf`; a non-empty file already on disk
//! is reused instead of re-downloaded, so interrupted runs resume without
//! duplicate transfers. Failed downloads remove their partial file.

use crate::error::{ResearchError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::debug;

const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Fetches paper documents and turns them into analyzable text.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Ensure the PDF for `arxiv_id` is on disk, returning its path.
    async fn fetch(&self, arxiv_id: &str, pdf_url: &str) -> Result<PathBuf>;

    /// Extract plain text from a downloaded PDF.
    async fn extract_text(&self, path: &Path) -> Result<String>;
}

pub struct DocumentStore {
    dir: PathBuf,
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl DocumentStore {
    pub fn new(dir: PathBuf, limiter: Arc<Semaphore>, retry: RetryPolicy) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            dir,
            client,
            limiter,
            retry,
        })
    }

    fn path_for(&self, arxiv_id: &str) -> PathBuf {
        self.dir.join(format!("{arxiv_id}.pdf"))
    }

    async fn download(&self, pdf_url: &str, path: &Path) -> Result<()> {
        let response = self
            .client
            .get(pdf_url)
            .send()
            .await
            .map_err(ResearchError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(ResearchError::RateLimited(retry_after));
        }
        if !status.is_success() {
            return Err(ResearchError::Api {
                code: status.as_u16() as i32,
                message: format!("PDF download failed with {status}"),
            });
        }

        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ResearchError::Network)?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(ResearchError::Pdf(format!("Empty download from {pdf_url}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentFetcher for DocumentStore {
    async fn fetch(&self, arxiv_id: &str, pdf_url: &str) -> Result<PathBuf> {
        let path = self.path_for(arxiv_id);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() > 0 {
                debug!(%arxiv_id, path = %path.display(), "PDF already on disk - skipping download");
                return Ok(path);
            }
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ResearchError::Config("concurrency limiter closed".to_string()))?;

        let result = self
            .retry
            .run("pdf download", || self.download(pdf_url, &path))
            .await;
        if result.is_err() {
            // A partial file must not satisfy the on-disk check on rerun
            let _ = tokio::fs::remove_file(&path).await;
        }
        result?;
        Ok(path)
    }

    async fn extract_text(&self, path: &Path) -> Result<String> {
        let owned = path.to_path_buf();
        let raw = tokio::task::spawn_blocking(move || -> std::result::Result<String, lopdf::Error> {
            let document = lopdf::Document::load(&owned)?;
            let pages: Vec<u32> = document.get_pages().keys().copied().collect();
            document.extract_text(&pages)
        })
        .await
        .map_err(|e| ResearchError::Pdf(format!("PDF extraction task failed: {e}")))?
        .map_err(|e| ResearchError::Pdf(format!("Failed to extract text: {e}")))?;

        Ok(normalize_text(&raw))
    }
}

/// Trim lines and drop blank ones; extraction output is full of both.
fn normalize_text(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
