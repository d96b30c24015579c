//! SQLite-backed record store for papers and research sessions.
//!
//! All SQL runs on a dedicated worker thread owning the single connection;
//! async callers hand closures over an mpsc channel and await a oneshot
//! reply. Every mutation is keyed by arXiv ID and last-write-wins on the
//! fields supplied, which makes the orchestrator's stage actions idempotent
//! and safe to resume after a crash.

use crate::error::{ResearchError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{error, info};

/// Schema version recorded in the SQLite `user_version` pragma
const SCHEMA_VERSION: i32 = 1;

/// Column list shared by every paper SELECT
const PAPER_COLUMNS: &str = "id, arxiv_id, title, authors, abstract, published_date, \
     arxiv_url, pdf_url, pdf_path, status, research_topic, relevance_score, \
     relevance_reason, improvement_category, problem_definition, mathematical_modeling, \
     core_innovation, theoretical_guarantee, experimental_design, quantitative_results, \
     limitations, innovation_ideas, analysis_json, session_id, created_at, updated_at";

// ============================================================================
// Status machine
// ============================================================================

/// Funnel position of a paper.
///
/// The single source of truth for what stage an item is in. Transitions are
/// written exclusively by the orchestrator; `irrelevant`, `download_failed`
/// and `analysis_failed` are terminal for an automated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperStatus {
    Discovered,
    Screening,
    Relevant,
    Irrelevant,
    Downloading,
    Downloaded,
    DownloadFailed,
    Analyzing,
    Analyzed,
    AnalysisFailed,
}

impl PaperStatus {
    /// All statuses in funnel order, for stats display
    pub const ALL: [PaperStatus; 10] = [
        PaperStatus::Discovered,
        PaperStatus::Screening,
        PaperStatus::Relevant,
        PaperStatus::Irrelevant,
        PaperStatus::Downloading,
        PaperStatus::Downloaded,
        PaperStatus::DownloadFailed,
        PaperStatus::Analyzing,
        PaperStatus::Analyzed,
        PaperStatus::AnalysisFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaperStatus::Discovered => "discovered",
            PaperStatus::Screening => "screening",
            PaperStatus::Relevant => "relevant",
            PaperStatus::Irrelevant => "irrelevant",
            PaperStatus::Downloading => "downloading",
            PaperStatus::Downloaded => "downloaded",
            PaperStatus::DownloadFailed => "download_failed",
            PaperStatus::Analyzing => "analyzing",
            PaperStatus::Analyzed => "analyzed",
            PaperStatus::AnalysisFailed => "analysis_failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "discovered" => Ok(PaperStatus::Discovered),
            "screening" => Ok(PaperStatus::Screening),
            "relevant" => Ok(PaperStatus::Relevant),
            "irrelevant" => Ok(PaperStatus::Irrelevant),
            "downloading" => Ok(PaperStatus::Downloading),
            "downloaded" => Ok(PaperStatus::Downloaded),
            "download_failed" => Ok(PaperStatus::DownloadFailed),
            "analyzing" => Ok(PaperStatus::Analyzing),
            "analyzed" => Ok(PaperStatus::Analyzed),
            "analysis_failed" => Ok(PaperStatus::AnalysisFailed),
            _ => Err(ResearchError::Parse(format!("unknown paper status '{value}'"))),
        }
    }
}

impl fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// One discovered document within one session.
#[derive(Debug, Clone)]
pub struct Paper {
    pub id: i64,
    pub arxiv_id: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub published_date: Option<String>,
    pub arxiv_url: String,
    pub pdf_url: String,
    pub pdf_path: Option<String>,
    pub status: PaperStatus,
    pub research_topic: Option<String>,
    pub relevance_score: Option<f64>,
    pub relevance_reason: Option<String>,
    pub improvement_category: Option<String>,
    pub problem_definition: Option<String>,
    pub mathematical_modeling: Option<String>,
    pub core_innovation: Option<String>,
    pub theoretical_guarantee: Option<String>,
    pub experimental_design: Option<String>,
    pub quantitative_results: Option<String>,
    pub limitations: Option<String>,
    pub innovation_ideas: Option<String>,
    pub analysis_json: Option<String>,
    pub session_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Metadata captured at discovery time; status starts at `discovered`.
#[derive(Debug, Clone)]
pub struct NewPaper {
    pub arxiv_id: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub published_date: Option<String>,
    pub arxiv_url: String,
    pub pdf_url: String,
    pub session_id: i64,
}

/// Partial update applied in one UPDATE statement.
///
/// Only supplied fields change; `updated_at` is always stamped.
#[derive(Debug, Clone, Default)]
pub struct PaperUpdate {
    pub status: Option<PaperStatus>,
    pub research_topic: Option<String>,
    pub relevance_score: Option<f64>,
    pub relevance_reason: Option<String>,
    pub pdf_path: Option<String>,
    pub improvement_category: Option<String>,
    pub problem_definition: Option<String>,
    pub mathematical_modeling: Option<String>,
    pub core_innovation: Option<String>,
    pub theoretical_guarantee: Option<String>,
    pub experimental_design: Option<String>,
    pub quantitative_results: Option<String>,
    pub limitations: Option<String>,
    pub innovation_ideas: Option<String>,
    pub analysis_json: Option<String>,
}

impl PaperUpdate {
    /// Shorthand for a bare status transition.
    pub fn status(status: PaperStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// One topic-scoped pipeline run.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub research_topic: String,
    pub keywords: Vec<String>,
    pub total_found: i64,
    pub relevant_count: i64,
    pub analyzed_count: i64,
    pub api_calls: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Query scope for existence checks, status queries and counts.
#[derive(Debug, Clone)]
pub enum Scope {
    /// Across every session
    Global,
    /// One session's records
    Session(i64),
    /// Records screened against a topic, across sessions
    Topic(String),
}

// ============================================================================
// Worker thread plumbing
// ============================================================================

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the record store. Cheap to clone; all clones share one
/// worker thread and connection.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("paperfunnel-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(ResearchError::Database(err)));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result = run_migrations(&mut conn);
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| ResearchError::Config(format!("failed to spawn store thread: {e}")))?;

        ready_rx.recv().map_err(|_| {
            ResearchError::DatabaseUnavailable(
                "store worker exited before signaling readiness".to_string(),
            )
        })??;

        info!(path = %db_path.display(), "Record store initialized");

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender.send(command).map_err(|err| {
            ResearchError::DatabaseUnavailable(format!("failed to reach store thread: {err}"))
        })?;

        reply_rx.await.map_err(|_| {
            ResearchError::DatabaseUnavailable("store thread terminated unexpectedly".to_string())
        })?
    }

    // ------------------------------------------------------------------
    // Papers
    // ------------------------------------------------------------------

    /// Whether a paper with this arXiv ID is already known within `scope`.
    pub async fn paper_exists(&self, arxiv_id: &str, scope: Scope) -> Result<bool> {
        let arxiv_id = arxiv_id.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = match scope {
                Scope::Global => conn
                    .query_row(
                        "SELECT 1 FROM papers WHERE arxiv_id = ?1 LIMIT 1",
                        params![arxiv_id],
                        |row| row.get(0),
                    )
                    .optional()?,
                Scope::Session(id) => conn
                    .query_row(
                        "SELECT 1 FROM papers WHERE arxiv_id = ?1 AND session_id = ?2 LIMIT 1",
                        params![arxiv_id, id],
                        |row| row.get(0),
                    )
                    .optional()?,
                Scope::Topic(topic) => conn
                    .query_row(
                        "SELECT 1 FROM papers WHERE arxiv_id = ?1 AND research_topic = ?2 LIMIT 1",
                        params![arxiv_id, topic],
                        |row| row.get(0),
                    )
                    .optional()?,
            };
            Ok(found.is_some())
        })
        .await
    }

    /// Insert a newly discovered paper with status `discovered`.
    ///
    /// Returns `ResearchError::Duplicate` if (arxiv_id, session_id) already
    /// exists; callers treat that as a no-op skip.
    pub async fn insert_paper(&self, paper: NewPaper) -> Result<i64> {
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            let result = conn.execute(
                "INSERT INTO papers (arxiv_id, title, authors, abstract, published_date, \
                 arxiv_url, pdf_url, status, session_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    paper.arxiv_id,
                    paper.title,
                    paper.authors,
                    paper.abstract_text,
                    paper.published_date,
                    paper.arxiv_url,
                    paper.pdf_url,
                    PaperStatus::Discovered.as_str(),
                    paper.session_id,
                    now,
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(ResearchError::Duplicate(paper.arxiv_id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Merge the supplied fields into the paper row in one UPDATE.
    pub async fn update_paper(&self, arxiv_id: &str, update: PaperUpdate) -> Result<()> {
        let arxiv_id = arxiv_id.to_string();
        self.execute(move |conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();
            {
                let mut push = |column: &str, value: Box<dyn ToSql>| {
                    sets.push(format!("{column} = ?"));
                    values.push(value);
                };
                if let Some(v) = update.status {
                    push("status", Box::new(v.as_str().to_string()));
                }
                if let Some(v) = update.research_topic {
                    push("research_topic", Box::new(v));
                }
                if let Some(v) = update.relevance_score {
                    push("relevance_score", Box::new(v));
                }
                if let Some(v) = update.relevance_reason {
                    push("relevance_reason", Box::new(v));
                }
                if let Some(v) = update.pdf_path {
                    push("pdf_path", Box::new(v));
                }
                if let Some(v) = update.improvement_category {
                    push("improvement_category", Box::new(v));
                }
                if let Some(v) = update.problem_definition {
                    push("problem_definition", Box::new(v));
                }
                if let Some(v) = update.mathematical_modeling {
                    push("mathematical_modeling", Box::new(v));
                }
                if let Some(v) = update.core_innovation {
                    push("core_innovation", Box::new(v));
                }
                if let Some(v) = update.theoretical_guarantee {
                    push("theoretical_guarantee", Box::new(v));
                }
                if let Some(v) = update.experimental_design {
                    push("experimental_design", Box::new(v));
                }
                if let Some(v) = update.quantitative_results {
                    push("quantitative_results", Box::new(v));
                }
                if let Some(v) = update.limitations {
                    push("limitations", Box::new(v));
                }
                if let Some(v) = update.innovation_ideas {
                    push("innovation_ideas", Box::new(v));
                }
                if let Some(v) = update.analysis_json {
                    push("analysis_json", Box::new(v));
                }
                push("updated_at", Box::new(Utc::now().to_rfc3339()));
            }
            values.push(Box::new(arxiv_id));

            let sql = format!("UPDATE papers SET {} WHERE arxiv_id = ?", sets.join(", "));
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            conn.execute(&sql, &refs[..])?;
            Ok(())
        })
        .await
    }

    /// Fetch one paper by arXiv ID (any session).
    pub async fn paper(&self, arxiv_id: &str) -> Result<Option<Paper>> {
        let arxiv_id = arxiv_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {PAPER_COLUMNS} FROM papers WHERE arxiv_id = ?1 LIMIT 1");
            Ok(conn
                .query_row(&sql, params![arxiv_id], row_to_paper)
                .optional()?)
        })
        .await
    }

    /// Papers in `status` within `scope`, in discovery order.
    pub async fn papers_with_status(
        &self,
        status: PaperStatus,
        scope: Scope,
    ) -> Result<Vec<Paper>> {
        self.execute(move |conn| {
            let mut sql = format!("SELECT {PAPER_COLUMNS} FROM papers WHERE status = ?");
            let mut values: Vec<Box<dyn ToSql>> =
                vec![Box::new(status.as_str().to_string())];
            match scope {
                Scope::Global => {}
                Scope::Session(id) => {
                    sql.push_str(" AND session_id = ?");
                    values.push(Box::new(id));
                }
                Scope::Topic(topic) => {
                    sql.push_str(" AND research_topic = ?");
                    values.push(Box::new(topic));
                }
            }
            sql.push_str(" ORDER BY id ASC");

            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&refs[..], row_to_paper)?;
            let mut papers = Vec::new();
            for row in rows {
                papers.push(row?);
            }
            Ok(papers)
        })
        .await
    }

    /// Count of papers in `status` within `scope`.
    pub async fn count_with_status(&self, status: PaperStatus, scope: Scope) -> Result<i64> {
        self.execute(move |conn| {
            let mut sql = String::from("SELECT COUNT(*) FROM papers WHERE status = ?");
            let mut values: Vec<Box<dyn ToSql>> =
                vec![Box::new(status.as_str().to_string())];
            match scope {
                Scope::Global => {}
                Scope::Session(id) => {
                    sql.push_str(" AND session_id = ?");
                    values.push(Box::new(id));
                }
                Scope::Topic(topic) => {
                    sql.push_str(" AND research_topic = ?");
                    values.push(Box::new(topic));
                }
            }
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            Ok(conn.query_row(&sql, &refs[..], |row| row.get(0))?)
        })
        .await
    }

    /// Status -> count mapping within `scope`.
    pub async fn status_counts(&self, scope: Scope) -> Result<Vec<(String, i64)>> {
        self.execute(move |conn| {
            let mut sql = String::from("SELECT status, COUNT(*) FROM papers");
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();
            match scope {
                Scope::Global => {}
                Scope::Session(id) => {
                    sql.push_str(" WHERE session_id = ?");
                    values.push(Box::new(id));
                }
                Scope::Topic(topic) => {
                    sql.push_str(" WHERE research_topic = ?");
                    values.push(Box::new(topic));
                }
            }
            sql.push_str(" GROUP BY status");

            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&refs[..], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = Vec::new();
            for row in rows {
                counts.push(row?);
            }
            Ok(counts)
        })
        .await
    }

    /// Analyzed papers for one session, newest publication first (export order).
    pub async fn analyzed_papers(&self, session_id: i64) -> Result<Vec<Paper>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {PAPER_COLUMNS} FROM papers \
                 WHERE session_id = ?1 AND status = 'analyzed' \
                 ORDER BY published_date DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![session_id], row_to_paper)?;
            let mut papers = Vec::new();
            for row in rows {
                papers.push(row?);
            }
            Ok(papers)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, topic: &str, keywords: &[String]) -> Result<i64> {
        let topic = topic.to_string();
        let keywords_json = serde_json::to_string(keywords)?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (research_topic, keywords, created_at) VALUES (?1, ?2, ?3)",
                params![topic, keywords_json, Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn session(&self, session_id: i64) -> Result<Option<Session>> {
        self.execute(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, research_topic, keywords, total_found, relevant_count, \
                     analyzed_count, api_calls, prompt_tokens, completion_tokens, \
                     total_tokens, created_at, completed_at \
                     FROM sessions WHERE id = ?1",
                    params![session_id],
                    row_to_session,
                )
                .optional()?)
        })
        .await
    }

    /// Checkpoint recompute of the session's discovered/relevant/analyzed counts.
    ///
    /// "Relevant" counts papers that passed screening and are still progressing
    /// or finished: relevant, downloading, downloaded, analyzing, analyzed.
    pub async fn refresh_session_counts(&self, session_id: i64) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions SET \
                 total_found = (SELECT COUNT(*) FROM papers WHERE session_id = ?1), \
                 relevant_count = (SELECT COUNT(*) FROM papers WHERE session_id = ?1 \
                     AND status IN ('relevant', 'downloading', 'downloaded', 'analyzing', 'analyzed')), \
                 analyzed_count = (SELECT COUNT(*) FROM papers WHERE session_id = ?1 \
                     AND status = 'analyzed') \
                 WHERE id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Record cumulative oracle usage on the session row.
    pub async fn record_session_usage(
        &self,
        session_id: i64,
        api_calls: u64,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions SET api_calls = ?1, prompt_tokens = ?2, \
                 completion_tokens = ?3, total_tokens = ?4 WHERE id = ?5",
                params![
                    api_calls as i64,
                    prompt_tokens as i64,
                    completion_tokens as i64,
                    total_tokens as i64,
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn complete_session(&self, session_id: i64) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions SET completed_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), session_id],
            )?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Row mapping & migrations
// ============================================================================

fn row_to_paper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Paper> {
    let status_raw: String = row.get("status")?;
    let status = PaperStatus::parse(&status_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Paper {
        id: row.get("id")?,
        arxiv_id: row.get("arxiv_id")?,
        title: row.get("title")?,
        authors: row.get("authors")?,
        abstract_text: row.get("abstract")?,
        published_date: row.get("published_date")?,
        arxiv_url: row.get("arxiv_url")?,
        pdf_url: row.get("pdf_url")?,
        pdf_path: row.get("pdf_path")?,
        status,
        research_topic: row.get("research_topic")?,
        relevance_score: row.get("relevance_score")?,
        relevance_reason: row.get("relevance_reason")?,
        improvement_category: row.get("improvement_category")?,
        problem_definition: row.get("problem_definition")?,
        mathematical_modeling: row.get("mathematical_modeling")?,
        core_innovation: row.get("core_innovation")?,
        theoretical_guarantee: row.get("theoretical_guarantee")?,
        experimental_design: row.get("experimental_design")?,
        quantitative_results: row.get("quantitative_results")?,
        limitations: row.get("limitations")?,
        innovation_ideas: row.get("innovation_ideas")?,
        analysis_json: row.get("analysis_json")?,
        session_id: row.get("session_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let keywords_json: String = row.get("keywords")?;
    let keywords: Vec<String> = serde_json::from_str(&keywords_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Session {
        id: row.get("id")?,
        research_topic: row.get("research_topic")?,
        keywords,
        total_found: row.get("total_found")?,
        relevant_count: row.get("relevant_count")?,
        analyzed_count: row.get("analyzed_count")?,
        api_calls: row.get("api_calls")?,
        prompt_tokens: row.get("prompt_tokens")?,
        completion_tokens: row.get("completion_tokens")?,
        total_tokens: row.get("total_tokens")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(ResearchError::Config(format!(
            "database schema version ({version}) is newer than supported ({SCHEMA_VERSION})"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        (dir, store)
    }

    fn sample_paper(arxiv_id: &str, session_id: i64) -> NewPaper {
        NewPaper {
            arxiv_id: arxiv_id.to_string(),
            title: format!("Paper {arxiv_id}"),
            authors: "Ada Lovelace, Alan Turing".to_string(),
            abstract_text: "We study an attention mechanism.".to_string(),
            published_date: Some("2024-01-05T18:59:59Z".to_string()),
            arxiv_url: format!("https://arxiv.org/abs/{arxiv_id}"),
            pdf_url: format!("https://arxiv.org/pdf/{arxiv_id}"),
            session_id,
        }
    }

    #[tokio::test]
    async fn test_insert_then_exists_scoped() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        store
            .insert_paper(sample_paper("2401.00001", session))
            .await
            .unwrap();

        assert!(store
            .paper_exists("2401.00001", Scope::Global)
            .await
            .unwrap());
        assert!(store
            .paper_exists("2401.00001", Scope::Session(session))
            .await
            .unwrap());
        assert!(!store
            .paper_exists("2401.00001", Scope::Session(session + 1))
            .await
            .unwrap());
        assert!(!store
            .paper_exists("2401.99999", Scope::Global)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_typed_error() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        store
            .insert_paper(sample_paper("2401.00001", session))
            .await
            .unwrap();

        let err = store
            .insert_paper(sample_paper("2401.00001", session))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Duplicate(id) if id == "2401.00001"));

        // Same ID under a different session is allowed.
        let other = store.create_session("sparse attention", &[]).await.unwrap();
        store
            .insert_paper(sample_paper("2401.00001", other))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_stamps_updated_at() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        store
            .insert_paper(sample_paper("2401.00001", session))
            .await
            .unwrap();

        let before = store.paper("2401.00001").await.unwrap().expect("inserted");
        store
            .update_paper(
                "2401.00001",
                PaperUpdate {
                    status: Some(PaperStatus::Relevant),
                    research_topic: Some("sparse attention".to_string()),
                    relevance_score: Some(87.5),
                    relevance_reason: Some("directly on topic".to_string()),
                    ..PaperUpdate::default()
                },
            )
            .await
            .unwrap();

        let after = store.paper("2401.00001").await.unwrap().expect("still there");
        assert_eq!(after.status, PaperStatus::Relevant);
        assert_eq!(after.relevance_score, Some(87.5));
        assert_eq!(after.research_topic.as_deref(), Some("sparse attention"));
        // Untouched fields survive the partial update.
        assert_eq!(after.title, before.title);
        assert_eq!(after.abstract_text, before.abstract_text);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn test_papers_with_status_scoping_and_order() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        for id in ["2401.00001", "2401.00002", "2401.00003"] {
            store.insert_paper(sample_paper(id, session)).await.unwrap();
            store
                .update_paper(
                    id,
                    PaperUpdate {
                        status: Some(PaperStatus::Relevant),
                        research_topic: Some("sparse attention".to_string()),
                        ..PaperUpdate::default()
                    },
                )
                .await
                .unwrap();
        }

        let by_topic = store
            .papers_with_status(
                PaperStatus::Relevant,
                Scope::Topic("sparse attention".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(by_topic.len(), 3);
        // Discovery order.
        let ids: Vec<&str> = by_topic.iter().map(|p| p.arxiv_id.as_str()).collect();
        assert_eq!(ids, vec!["2401.00001", "2401.00002", "2401.00003"]);

        let other_topic = store
            .papers_with_status(PaperStatus::Relevant, Scope::Topic("biology".to_string()))
            .await
            .unwrap();
        assert!(other_topic.is_empty());

        assert_eq!(
            store
                .count_with_status(
                    PaperStatus::Relevant,
                    Scope::Topic("sparse attention".to_string())
                )
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        store
            .insert_paper(sample_paper("2401.00001", session))
            .await
            .unwrap();
        store
            .insert_paper(sample_paper("2401.00002", session))
            .await
            .unwrap();
        store
            .update_paper("2401.00002", PaperUpdate::status(PaperStatus::Irrelevant))
            .await
            .unwrap();

        let counts = store.status_counts(Scope::Session(session)).await.unwrap();
        let lookup = |status: &str| {
            counts
                .iter()
                .find(|(s, _)| s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        assert_eq!(lookup("discovered"), 1);
        assert_eq!(lookup("irrelevant"), 1);
        assert_eq!(lookup("analyzed"), 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_counts() {
        let (_dir, store) = open_store();
        let keywords = vec!["sparse attention".to_string(), "efficient transformer".to_string()];
        let session_id = store
            .create_session("sparse attention efficiency", &keywords)
            .await
            .unwrap();

        let session = store.session(session_id).await.unwrap().expect("created");
        assert_eq!(session.research_topic, "sparse attention efficiency");
        assert_eq!(session.keywords, keywords);
        assert!(session.completed_at.is_none());

        store
            .insert_paper(sample_paper("2401.00001", session_id))
            .await
            .unwrap();
        store
            .insert_paper(sample_paper("2401.00002", session_id))
            .await
            .unwrap();
        store
            .update_paper("2401.00001", PaperUpdate::status(PaperStatus::Analyzed))
            .await
            .unwrap();
        store
            .update_paper("2401.00002", PaperUpdate::status(PaperStatus::Downloaded))
            .await
            .unwrap();

        store.refresh_session_counts(session_id).await.unwrap();
        store
            .record_session_usage(session_id, 12, 3400, 900, 4300)
            .await
            .unwrap();
        store.complete_session(session_id).await.unwrap();

        let session = store.session(session_id).await.unwrap().expect("updated");
        assert_eq!(session.total_found, 2);
        assert_eq!(session.relevant_count, 2);
        assert_eq!(session.analyzed_count, 1);
        assert_eq!(session.api_calls, 12);
        assert_eq!(session.total_tokens, 4300);
        assert!(session.completed_at.is_some());

        assert!(store.session(session_id + 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyzed_papers_newest_first() {
        let (_dir, store) = open_store();
        let session = store.create_session("sparse attention", &[]).await.unwrap();

        let mut older = sample_paper("2311.00001", session);
        older.published_date = Some("2023-11-02T00:00:00Z".to_string());
        let mut newer = sample_paper("2401.00002", session);
        newer.published_date = Some("2024-01-20T00:00:00Z".to_string());
        store.insert_paper(older).await.unwrap();
        store.insert_paper(newer).await.unwrap();
        for id in ["2311.00001", "2401.00002"] {
            store
                .update_paper(id, PaperUpdate::status(PaperStatus::Analyzed))
                .await
                .unwrap();
        }

        let analyzed = store.analyzed_papers(session).await.unwrap();
        assert_eq!(analyzed.len(), 2);
        assert_eq!(analyzed[0].arxiv_id, "2401.00002");
        assert_eq!(analyzed[1].arxiv_id, "2311.00001");
    }

    #[test]
    fn test_status_round_trip() {
        for status in PaperStatus::ALL {
            assert_eq!(PaperStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaperStatus::parse("no_such_status").is_err());
    }
}
