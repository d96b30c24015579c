//! Session exports: a CSV of analyzed papers and a Markdown report.
//!
//! Both artifacts carry the session id and a timestamp in their filename, so
//! repeated exports never overwrite each other. Papers appear newest
//! publication first.

use crate::error::{ResearchError, Result};
use crate::oracle::{ImprovementCategory, NOT_STATED};
use crate::store::{Paper, Session, Store};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Cap on entries in the candidate-ideas rollup
const MAX_IDEAS: usize = 20;

/// Flat CSV row for one analyzed paper.
#[derive(Debug, Serialize)]
struct PaperRow<'a> {
    title: &'a str,
    arxiv_id: &'a str,
    arxiv_url: &'a str,
    published_date: &'a str,
    authors: &'a str,
    #[serde(rename = "abstract")]
    abstract_text: &'a str,
    relevance_score: f64,
    improvement_category: &'a str,
    problem_definition: &'a str,
    mathematical_modeling: &'a str,
    core_innovation: &'a str,
    theoretical_guarantee: &'a str,
    experimental_design: &'a str,
    quantitative_results: &'a str,
    limitations: &'a str,
    innovation_ideas: &'a str,
}

fn text_or_sentinel(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or(NOT_STATED)
}

impl<'a> PaperRow<'a> {
    fn from_paper(paper: &'a Paper) -> Self {
        Self {
            title: &paper.title,
            arxiv_id: &paper.arxiv_id,
            arxiv_url: &paper.arxiv_url,
            published_date: paper.published_date.as_deref().unwrap_or(""),
            authors: &paper.authors,
            abstract_text: &paper.abstract_text,
            relevance_score: paper.relevance_score.unwrap_or(0.0),
            improvement_category: paper
                .improvement_category
                .as_deref()
                .unwrap_or(ImprovementCategory::Other.as_str()),
            problem_definition: text_or_sentinel(&paper.problem_definition),
            mathematical_modeling: text_or_sentinel(&paper.mathematical_modeling),
            core_innovation: text_or_sentinel(&paper.core_innovation),
            theoretical_guarantee: text_or_sentinel(&paper.theoretical_guarantee),
            experimental_design: text_or_sentinel(&paper.experimental_design),
            quantitative_results: text_or_sentinel(&paper.quantitative_results),
            limitations: text_or_sentinel(&paper.limitations),
            innovation_ideas: text_or_sentinel(&paper.innovation_ideas),
        }
    }
}

/// Export one session's analyzed papers, returning (csv path, report path).
pub async fn export_session(
    store: &Store,
    session_id: i64,
    out_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let session = store
        .session(session_id)
        .await?
        .ok_or_else(|| ResearchError::Config(format!("unknown session {session_id}")))?;
    let papers = store.analyzed_papers(session_id).await?;
    if papers.is_empty() {
        return Err(ResearchError::Config(format!(
            "session {session_id} has no analyzed papers to export"
        )));
    }

    std::fs::create_dir_all(out_dir)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let csv_path = out_dir.join(format!("papers_{session_id}_{timestamp}.csv"));
    let report_path = out_dir.join(format!("report_{session_id}_{timestamp}.md"));

    write_csv(&csv_path, &papers)?;
    std::fs::write(&report_path, render_markdown(&session, &papers))?;

    info!(
        papers = papers.len(),
        csv = %csv_path.display(),
        report = %report_path.display(),
        "Session exported"
    );
    Ok((csv_path, report_path))
}

fn write_csv(path: &Path, papers: &[Paper]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().from_path(path)?;
    for paper in papers {
        writer.serialize(PaperRow::from_paper(paper))?;
    }
    writer.flush()?;
    Ok(())
}

fn category_of(paper: &Paper) -> ImprovementCategory {
    ImprovementCategory::coerce(paper.improvement_category.as_deref().unwrap_or(""))
}

/// Render the Markdown report for a session.
fn render_markdown(session: &Session, papers: &[Paper]) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Research Report: {}\n\n", session.research_topic));
    out.push_str(&format!("- Session: {}\n", session.id));
    if !session.keywords.is_empty() {
        out.push_str(&format!("- Keywords: {}\n", session.keywords.join(", ")));
    }
    out.push_str(&format!(
        "- Generated: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("- Analyzed papers: {}\n\n", papers.len()));

    out.push_str("## Category distribution\n\n");
    for category in ImprovementCategory::ALL {
        let count = papers.iter().filter(|p| category_of(p) == category).count();
        if count > 0 {
            out.push_str(&format!("- {}: {}\n", category.label(), count));
        }
    }
    out.push('\n');

    out.push_str("## Papers\n\n");
    for (i, paper) in papers.iter().enumerate() {
        out.push_str(&format!("### {}. {}\n\n", i + 1, paper.title));
        out.push_str(&format!(
            "- arXiv: [{}]({})\n",
            paper.arxiv_id, paper.arxiv_url
        ));
        if let Some(date) = &paper.published_date {
            out.push_str(&format!("- Published: {date}\n"));
        }
        out.push_str(&format!("- Authors: {}\n", paper.authors));
        out.push_str(&format!(
            "- Relevance: {:.1}",
            paper.relevance_score.unwrap_or(0.0)
        ));
        if let Some(reason) = &paper.relevance_reason {
            out.push_str(&format!(" ({reason})"));
        }
        out.push('\n');
        out.push_str(&format!("- Category: {}\n\n", category_of(paper).label()));

        let sections = [
            ("Problem", &paper.problem_definition),
            ("Modeling", &paper.mathematical_modeling),
            ("Core innovation", &paper.core_innovation),
            ("Theoretical guarantee", &paper.theoretical_guarantee),
            ("Experimental design", &paper.experimental_design),
            ("Quantitative results", &paper.quantitative_results),
            ("Limitations", &paper.limitations),
            ("Follow-up ideas", &paper.innovation_ideas),
        ];
        for (heading, body) in sections {
            out.push_str(&format!("**{heading}.** {}\n\n", text_or_sentinel(body)));
        }
    }

    out.push_str("## Core innovations by category\n\n");
    for category in ImprovementCategory::ALL {
        let members: Vec<&Paper> = papers
            .iter()
            .filter(|p| category_of(p) == category)
            .collect();
        if members.is_empty() {
            continue;
        }
        out.push_str(&format!("### {}\n\n", category.label()));
        for paper in members {
            out.push_str(&format!(
                "- **{}**: {}\n",
                paper.title,
                text_or_sentinel(&paper.core_innovation)
            ));
        }
        out.push('\n');
    }

    out.push_str("## Candidate research ideas\n\n");
    let ideas: Vec<(&Paper, &str)> = papers
        .iter()
        .filter_map(|p| match p.innovation_ideas.as_deref() {
            Some(text) if !text.is_empty() && text != NOT_STATED => Some((p, text)),
            _ => None,
        })
        .take(MAX_IDEAS)
        .collect();
    if ideas.is_empty() {
        out.push_str("No concrete follow-up ideas were extracted.\n");
    } else {
        for (i, (paper, text)) in ideas.iter().enumerate() {
            out.push_str(&format!("{}. **{}**: {}\n", i + 1, paper.title, text));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewPaper, PaperStatus, PaperUpdate};
    use tempfile::TempDir;

    async fn seed_analyzed(
        store: &Store,
        session: i64,
        arxiv_id: &str,
        published: &str,
        category: &str,
        ideas: &str,
    ) {
        store
            .insert_paper(NewPaper {
                arxiv_id: arxiv_id.to_string(),
                title: format!("Paper {arxiv_id}"),
                authors: "Ada Lovelace, Alan Turing".to_string(),
                abstract_text: "We study sparse attention.".to_string(),
                published_date: Some(published.to_string()),
                arxiv_url: format!("https://arxiv.org/abs/{arxiv_id}"),
                pdf_url: format!("https://arxiv.org/pdf/{arxiv_id}"),
                session_id: session,
            })
            .await
            .expect("insert");
        store
            .update_paper(
                arxiv_id,
                PaperUpdate {
                    status: Some(PaperStatus::Analyzed),
                    research_topic: Some("sparse attention".to_string()),
                    relevance_score: Some(88.0),
                    relevance_reason: Some("on topic".to_string()),
                    improvement_category: Some(category.to_string()),
                    problem_definition: Some("quadratic attention cost".to_string()),
                    mathematical_modeling: Some("block-sparse factorization".to_string()),
                    core_innovation: Some("sliding-window kernel".to_string()),
                    theoretical_guarantee: Some("not stated".to_string()),
                    experimental_design: Some("LRA benchmark".to_string()),
                    quantitative_results: Some("2.3x speedup".to_string()),
                    limitations: Some("fixed block size".to_string()),
                    innovation_ideas: Some(ideas.to_string()),
                    analysis_json: Some("{}".to_string()),
                    ..PaperUpdate::default()
                },
            )
            .await
            .expect("update");
    }

    #[tokio::test]
    async fn test_export_session_writes_both_files() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let session = store
            .create_session("sparse attention", &["sparse attention".to_string()])
            .await
            .unwrap();
        seed_analyzed(
            &store,
            session,
            "2401.00001",
            "2024-01-10",
            "efficiency_optimization",
            "combine with quantization",
        )
        .await;
        seed_analyzed(
            &store,
            session,
            "2402.00002",
            "2024-02-03",
            "theoretical_analysis",
            "not stated",
        )
        .await;

        let out_dir = dir.path().join("papers_output");
        let (csv_path, report_path) = export_session(&store, session, &out_dir).await.unwrap();

        let csv_name = csv_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(csv_name.starts_with(&format!("papers_{session}_")));
        assert!(csv_name.ends_with(".csv"));
        let report_name = report_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(report_name.starts_with(&format!("report_{session}_")));
        assert!(report_name.ends_with(".md"));

        let csv_text = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = csv_text.lines();
        let header = lines.next().expect("header");
        assert!(header.starts_with("title,arxiv_id,arxiv_url"));
        assert!(header.contains(",abstract,"));
        // Newest publication first.
        assert!(lines.next().expect("first row").contains("2402.00002"));
        assert!(lines.next().expect("second row").contains("2401.00001"));

        let report_text = std::fs::read_to_string(&report_path).unwrap();
        assert!(report_text.contains("# Research Report: sparse attention"));
        assert!(report_text.contains("- Analyzed papers: 2"));
        assert!(report_text.contains("- Efficiency optimization: 1"));
        assert!(report_text.contains("- Theoretical analysis: 1"));
        assert!(report_text.contains("### 1. Paper 2402.00002"));
        assert!(report_text.contains("**Core innovation.** sliding-window kernel"));
    }

    #[tokio::test]
    async fn test_ideas_rollup_skips_sentinel() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        seed_analyzed(
            &store,
            session,
            "2401.00001",
            "2024-01-10",
            "other",
            "not stated",
        )
        .await;
        seed_analyzed(
            &store,
            session,
            "2402.00002",
            "2024-02-03",
            "other",
            "try hierarchical routing",
        )
        .await;

        let papers = store.analyzed_papers(session).await.unwrap();
        let session_row = store.session(session).await.unwrap().expect("session");
        let markdown = render_markdown(&session_row, &papers);

        // Only the concrete idea survives the sentinel filter.
        assert!(markdown.contains("1. **Paper 2402.00002**: try hierarchical routing"));
        assert!(!markdown.contains("1. **Paper 2401.00001**"));
        assert!(!markdown.contains("2. **Paper"));
    }

    #[tokio::test]
    async fn test_export_unknown_session_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let result = export_session(&store, 999, dir.path()).await;
        assert!(matches!(result, Err(ResearchError::Config(_))));
    }

    #[tokio::test]
    async fn test_export_without_analyzed_papers_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let session = store.create_session("sparse attention", &[]).await.unwrap();
        let result = export_session(&store, session, dir.path()).await;
        assert!(matches!(result, Err(ResearchError::Config(_))));
    }
}
