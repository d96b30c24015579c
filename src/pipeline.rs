//! Funnel orchestrator: search -> screen -> select -> download -> analyze.
//!
//! Each stage reads its work from the store by status, so an interrupted run
//! resumes from the records rather than from in-memory state. Per-item
//! failures downgrade that item's status and never abort the batch; only
//! store failures and search-page failures end the run.

use crate::arxiv::{self, DiscoveredPaper, SearchIndex};
use crate::error::{ResearchError, Result};
use crate::oracle::{Oracle, Screening};
use crate::pdf::DocumentFetcher;
use crate::store::{NewPaper, Paper, PaperStatus, PaperUpdate, Scope, Store};
use futures::{stream, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunable limits for one funnel run.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    /// Stop searching once this many results have been examined
    pub max_search: usize,
    /// Papers that proceed to download and deep analysis
    pub max_analysis: usize,
    /// Minimum relevance score for the analysis shortlist
    pub relevance_threshold: f64,
    /// Results requested per search page
    pub batch_size: usize,
    /// Concurrent items per stage fan-out
    pub concurrency: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            max_search: 50,
            max_analysis: 10,
            relevance_threshold: 60.0,
            batch_size: 25,
            concurrency: 10,
        }
    }
}

/// Stage toggles for partial runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_search: bool,
    pub skip_screening: bool,
    pub skip_download: bool,
    pub skip_analysis: bool,
}

/// What one run did, for the end-of-run summary.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub discovered: usize,
    pub relevant: usize,
    pub irrelevant: usize,
    pub selected: usize,
    pub rank_excluded: usize,
    pub downloaded: usize,
    pub download_failed: usize,
    pub analyzed: usize,
    pub analysis_failed: usize,
}

pub struct Pipeline {
    store: Store,
    searcher: Arc<dyn SearchIndex>,
    oracle: Arc<dyn Oracle>,
    documents: Arc<dyn DocumentFetcher>,
    config: FunnelConfig,
}

impl Pipeline {
    pub fn new(
        store: Store,
        searcher: Arc<dyn SearchIndex>,
        oracle: Arc<dyn Oracle>,
        documents: Arc<dyn DocumentFetcher>,
        config: FunnelConfig,
    ) -> Self {
        Self {
            store,
            searcher,
            oracle,
            documents,
            config,
        }
    }

    /// Decide the search keywords for a topic.
    ///
    /// Explicit keywords win; otherwise the oracle suggests some, falling
    /// back to the raw topic if suggestion is disabled or fails.
    pub async fn resolve_keywords(
        &self,
        topic: &str,
        explicit: &[String],
        auto: bool,
    ) -> Vec<String> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        if !auto {
            return vec![topic.to_string()];
        }
        match self.oracle.suggest_keywords(topic).await {
            Ok(keywords) => {
                info!(?keywords, "Search keywords suggested");
                keywords
            }
            Err(err) => {
                warn!(error = %err, "Keyword suggestion failed - using the raw topic");
                vec![topic.to_string()]
            }
        }
    }

    /// Run the funnel end to end for one session.
    pub async fn run(
        &self,
        session_id: i64,
        topic: &str,
        keywords: &[String],
        opts: RunOptions,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();

        if !opts.skip_screening {
            let leftovers = self
                .store
                .papers_with_status(PaperStatus::Discovered, Scope::Session(session_id))
                .await?;
            if !leftovers.is_empty() {
                info!(count = leftovers.len(), "Screening papers left over from an earlier run");
                let outcomes = stream::iter(leftovers.iter())
                    .map(|p| self.screen_one(topic, &p.arxiv_id, &p.title, &p.abstract_text))
                    .buffer_unordered(self.config.concurrency)
                    .collect::<Vec<_>>()
                    .await;
                tally(outcomes, &mut report.relevant, &mut report.irrelevant)?;
            }
        }

        if !opts.skip_search {
            self.search_stage(session_id, topic, keywords, opts, &mut report)
                .await?;
            self.checkpoint(session_id).await?;
        }

        if !opts.skip_download {
            let selected = self.select_for_analysis(topic, &mut report).await?;
            self.download_stage(&selected, &mut report).await?;
            self.checkpoint(session_id).await?;
        }

        if !opts.skip_analysis {
            self.analysis_stage(topic, &mut report).await?;
        }

        self.checkpoint(session_id).await?;
        self.store.complete_session(session_id).await?;
        info!(?report, "Run complete");
        Ok(report)
    }

    /// Search in pages, persisting and screening new papers as they arrive.
    ///
    /// Stops at the search ceiling, when a page yields nothing new, or once
    /// enough relevant papers exist to fill the analysis quota.
    async fn search_stage(
        &self,
        session_id: i64,
        topic: &str,
        keywords: &[String],
        opts: RunOptions,
        report: &mut RunReport,
    ) -> Result<()> {
        let query = arxiv::build_query(keywords);
        info!(%query, ceiling = self.config.max_search, "Searching arXiv");

        let mut offset = 0usize;
        let mut searched_total = 0usize;

        loop {
            let batch = self
                .searcher
                .search(&query, self.config.batch_size, offset)
                .await?;
            if batch.is_empty() {
                info!("Search returned no further results");
                break;
            }
            let page_len = batch.len();

            let mut fresh: Vec<DiscoveredPaper> = Vec::new();
            for discovered in batch {
                if self
                    .store
                    .paper_exists(&discovered.arxiv_id, Scope::Global)
                    .await?
                {
                    debug!(arxiv_id = %discovered.arxiv_id, "Already known - skipping");
                    continue;
                }
                let record = NewPaper {
                    arxiv_id: discovered.arxiv_id.clone(),
                    title: discovered.title.clone(),
                    authors: discovered.authors.clone(),
                    abstract_text: discovered.abstract_text.clone(),
                    published_date: discovered.published_date.clone(),
                    arxiv_url: discovered.arxiv_url.clone(),
                    pdf_url: discovered.pdf_url.clone(),
                    session_id,
                };
                match self.store.insert_paper(record).await {
                    Ok(_) => {
                        report.discovered += 1;
                        fresh.push(discovered);
                    }
                    Err(ResearchError::Duplicate(id)) => {
                        debug!(arxiv_id = %id, "Concurrent duplicate - skipping");
                    }
                    Err(err) => return Err(err),
                }
            }

            if fresh.is_empty() {
                info!("No new papers on this page - stopping search");
                break;
            }

            if !opts.skip_screening {
                let outcomes = stream::iter(fresh.iter())
                    .map(|p| self.screen_one(topic, &p.arxiv_id, &p.title, &p.abstract_text))
                    .buffer_unordered(self.config.concurrency)
                    .collect::<Vec<_>>()
                    .await;
                tally(outcomes, &mut report.relevant, &mut report.irrelevant)?;
            }

            searched_total += page_len;
            if searched_total >= self.config.max_search {
                info!(searched_total, "Reached the search ceiling");
                break;
            }

            if !opts.skip_screening {
                let relevant_now = self
                    .store
                    .count_with_status(PaperStatus::Relevant, Scope::Topic(topic.to_string()))
                    .await?;
                if relevant_now as usize >= self.config.max_analysis {
                    info!(relevant = relevant_now, "Analysis quota filled - stopping search");
                    break;
                }
            }

            offset += page_len;
        }
        Ok(())
    }

    /// Screen one paper; an oracle failure downgrades it instead of erroring.
    async fn screen_one(
        &self,
        topic: &str,
        arxiv_id: &str,
        title: &str,
        abstract_text: &str,
    ) -> Result<bool> {
        self.store
            .update_paper(arxiv_id, PaperUpdate::status(PaperStatus::Screening))
            .await?;

        let screening = match self.oracle.classify(topic, title, abstract_text).await {
            Ok(screening) => screening,
            Err(err) => {
                warn!(%arxiv_id, error = %err, "Screening call failed - marking not relevant");
                Screening {
                    score: 0.0,
                    pass: false,
                    rationale: format!("Screening failed: {err}"),
                }
            }
        };

        let status = if screening.pass {
            PaperStatus::Relevant
        } else {
            PaperStatus::Irrelevant
        };
        info!(%arxiv_id, score = screening.score, relevant = screening.pass, "Screened");

        self.store
            .update_paper(
                arxiv_id,
                PaperUpdate {
                    status: Some(status),
                    research_topic: Some(topic.to_string()),
                    relevance_score: Some(screening.score),
                    relevance_reason: Some(screening.rationale),
                    ..PaperUpdate::default()
                },
            )
            .await?;
        Ok(screening.pass)
    }

    /// Shortlist relevant papers for analysis: at or above the threshold,
    /// best scores first, capped at the analysis quota.
    ///
    /// Papers cut by the cap are demoted to irrelevant with the rank noted on
    /// their screening reason; below-threshold papers keep their status.
    async fn select_for_analysis(
        &self,
        topic: &str,
        report: &mut RunReport,
    ) -> Result<Vec<Paper>> {
        let mut candidates = self
            .store
            .papers_with_status(PaperStatus::Relevant, Scope::Topic(topic.to_string()))
            .await?;
        candidates.retain(|p| p.relevance_score.unwrap_or(0.0) >= self.config.relevance_threshold);
        // Stable sort: ties keep discovery order
        candidates.sort_by(|a, b| {
            b.relevance_score
                .unwrap_or(0.0)
                .partial_cmp(&a.relevance_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let cutoff = self.config.max_analysis.min(candidates.len());
        let overflow = candidates.split_off(cutoff);
        for (i, paper) in overflow.iter().enumerate() {
            let position = cutoff + i + 1;
            let mut reason = paper.relevance_reason.clone().unwrap_or_default();
            if !reason.is_empty() {
                reason.push(' ');
            }
            reason.push_str(&format!(
                "[excluded by rank: position {position} exceeds analysis limit {}]",
                self.config.max_analysis
            ));
            self.store
                .update_paper(
                    &paper.arxiv_id,
                    PaperUpdate {
                        status: Some(PaperStatus::Irrelevant),
                        relevance_reason: Some(reason),
                        ..PaperUpdate::default()
                    },
                )
                .await?;
            report.rank_excluded += 1;
        }

        report.selected = candidates.len();
        if !candidates.is_empty() {
            info!(
                selected = candidates.len(),
                excluded = overflow.len(),
                "Shortlisted papers for analysis"
            );
        }
        Ok(candidates)
    }

    async fn download_stage(&self, selected: &[Paper], report: &mut RunReport) -> Result<()> {
        if selected.is_empty() {
            info!("Nothing to download");
            return Ok(());
        }
        info!(count = selected.len(), "Downloading PDFs");

        let outcomes = stream::iter(selected.iter())
            .map(|paper| self.download_one(paper))
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await;
        tally(outcomes, &mut report.downloaded, &mut report.download_failed)
    }

    async fn download_one(&self, paper: &Paper) -> Result<bool> {
        self.store
            .update_paper(&paper.arxiv_id, PaperUpdate::status(PaperStatus::Downloading))
            .await?;

        match self.documents.fetch(&paper.arxiv_id, &paper.pdf_url).await {
            Ok(path) => {
                self.store
                    .update_paper(
                        &paper.arxiv_id,
                        PaperUpdate {
                            status: Some(PaperStatus::Downloaded),
                            pdf_path: Some(path.display().to_string()),
                            ..PaperUpdate::default()
                        },
                    )
                    .await?;
                Ok(true)
            }
            Err(err) => {
                warn!(arxiv_id = %paper.arxiv_id, error = %err, "PDF download failed");
                self.store
                    .update_paper(
                        &paper.arxiv_id,
                        PaperUpdate::status(PaperStatus::DownloadFailed),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    /// Deep-analyze every downloaded paper for the topic.
    async fn analysis_stage(&self, topic: &str, report: &mut RunReport) -> Result<()> {
        let ready = self
            .store
            .papers_with_status(PaperStatus::Downloaded, Scope::Topic(topic.to_string()))
            .await?;
        if ready.is_empty() {
            info!("No downloaded papers awaiting analysis");
            return Ok(());
        }
        info!(count = ready.len(), "Analyzing papers");

        let outcomes = stream::iter(ready.iter())
            .map(|paper| self.analyze_one(topic, paper))
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await;
        tally(outcomes, &mut report.analyzed, &mut report.analysis_failed)
    }

    /// Analyze one paper; extraction or oracle failures downgrade it.
    async fn analyze_one(&self, topic: &str, paper: &Paper) -> Result<bool> {
        self.store
            .update_paper(&paper.arxiv_id, PaperUpdate::status(PaperStatus::Analyzing))
            .await?;

        let text = match &paper.pdf_path {
            Some(path) => match self.documents.extract_text(Path::new(path)).await {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => {
                    warn!(arxiv_id = %paper.arxiv_id, "PDF produced no text");
                    return self.mark_analysis_failed(&paper.arxiv_id).await;
                }
                Err(err) => {
                    warn!(arxiv_id = %paper.arxiv_id, error = %err, "Text extraction failed");
                    return self.mark_analysis_failed(&paper.arxiv_id).await;
                }
            },
            None => {
                warn!(arxiv_id = %paper.arxiv_id, "Downloaded paper has no stored PDF path");
                return self.mark_analysis_failed(&paper.arxiv_id).await;
            }
        };

        match self.oracle.extract(topic, &paper.title, &text).await {
            Ok(analysis) => {
                let analysis_json = serde_json::to_string(&analysis)?;
                self.store
                    .update_paper(
                        &paper.arxiv_id,
                        PaperUpdate {
                            status: Some(PaperStatus::Analyzed),
                            improvement_category: Some(analysis.improvement_category.clone()),
                            problem_definition: Some(analysis.problem_definition),
                            mathematical_modeling: Some(analysis.mathematical_modeling),
                            core_innovation: Some(analysis.core_innovation),
                            theoretical_guarantee: Some(analysis.theoretical_guarantee),
                            experimental_design: Some(analysis.experimental_design),
                            quantitative_results: Some(analysis.quantitative_results),
                            limitations: Some(analysis.limitations),
                            innovation_ideas: Some(analysis.innovation_ideas),
                            analysis_json: Some(analysis_json),
                            ..PaperUpdate::default()
                        },
                    )
                    .await?;
                info!(arxiv_id = %paper.arxiv_id, "Analysis complete");
                Ok(true)
            }
            Err(err) => {
                warn!(arxiv_id = %paper.arxiv_id, error = %err, "Analysis failed");
                self.mark_analysis_failed(&paper.arxiv_id).await
            }
        }
    }

    async fn mark_analysis_failed(&self, arxiv_id: &str) -> Result<bool> {
        self.store
            .update_paper(arxiv_id, PaperUpdate::status(PaperStatus::AnalysisFailed))
            .await?;
        Ok(false)
    }

    /// Persist session counters and oracle usage.
    async fn checkpoint(&self, session_id: i64) -> Result<()> {
        self.store.refresh_session_counts(session_id).await?;
        let usage = self.oracle.usage();
        self.store
            .record_session_usage(
                session_id,
                usage.api_calls,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
            )
            .await
    }
}

/// Fold per-item outcomes into counters; only store errors propagate.
fn tally(outcomes: Vec<Result<bool>>, passed: &mut usize, failed: &mut usize) -> Result<()> {
    for outcome in outcomes {
        match outcome {
            Ok(true) => *passed += 1,
            Ok(false) => *failed += 1,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{PaperAnalysis, UsageSnapshot};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tempfile::TempDir;

    const TOPIC: &str = "sparse attention";

    // ------------------------------------------------------------------
    // Mock adapters
    // ------------------------------------------------------------------

    /// Serves `total` synthetic papers in pages, newest first.
    struct MockSearch {
        total: usize,
        calls: AtomicUsize,
    }

    impl MockSearch {
        fn with_total(total: usize) -> Self {
            Self {
                total,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn mock_id(position: usize) -> String {
        format!("2400.{position:05}")
    }

    #[async_trait]
    impl SearchIndex for MockSearch {
        async fn search(
            &self,
            _query: &str,
            max_results: usize,
            offset: usize,
        ) -> Result<Vec<DiscoveredPaper>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let end = (offset + max_results).min(self.total);
            let papers = (offset..end)
                .map(|i| {
                    let arxiv_id = mock_id(i + 1);
                    DiscoveredPaper {
                        title: format!("Paper {arxiv_id}"),
                        authors: "Ada Lovelace".to_string(),
                        abstract_text: format!("Abstract for {arxiv_id}."),
                        published_date: Some(format!("2024-01-{:02}", (i % 27) + 1)),
                        arxiv_url: format!("https://arxiv.org/abs/{arxiv_id}"),
                        pdf_url: format!("https://arxiv.org/pdf/{arxiv_id}"),
                        arxiv_id,
                    }
                })
                .collect();
            Ok(papers)
        }
    }

    /// Scores papers by arXiv ID found in the title; unknown IDs score 10.
    struct MockOracle {
        scores: HashMap<String, f64>,
        fail_classify: HashSet<String>,
        fail_extract: HashSet<String>,
        keywords: Option<Vec<String>>,
        calls: AtomicU64,
    }

    impl MockOracle {
        fn with_scores(scores: &[(usize, f64)]) -> Self {
            Self {
                scores: scores
                    .iter()
                    .map(|(pos, score)| (mock_id(*pos), *score))
                    .collect(),
                fail_classify: HashSet::new(),
                fail_extract: HashSet::new(),
                keywords: Some(vec!["sparse attention".to_string()]),
                calls: AtomicU64::new(0),
            }
        }

        fn lookup(&self, title: &str) -> Option<(&String, &f64)> {
            self.scores.iter().find(|(id, _)| title.contains(id.as_str()))
        }
    }

    #[async_trait]
    impl Oracle for MockOracle {
        async fn classify(&self, _topic: &str, title: &str, _abstract: &str) -> Result<Screening> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_classify.iter().any(|id| title.contains(id.as_str())) {
                return Err(ResearchError::Api {
                    code: 500,
                    message: "mock classify outage".to_string(),
                });
            }
            let score = self.lookup(title).map(|(_, s)| *s).unwrap_or(10.0);
            Ok(Screening {
                score,
                pass: score > 60.0,
                rationale: format!("mock score {score}"),
            })
        }

        async fn extract(
            &self,
            _topic: &str,
            title: &str,
            _document_text: &str,
        ) -> Result<PaperAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_extract.iter().any(|id| title.contains(id.as_str())) {
                return Err(ResearchError::Parse("mock extract garbage".to_string()));
            }
            Ok(PaperAnalysis {
                problem_definition: "long-context cost".to_string(),
                mathematical_modeling: "not stated".to_string(),
                core_innovation: format!("innovation from {title}"),
                theoretical_guarantee: "not stated".to_string(),
                experimental_design: "benchmarks".to_string(),
                quantitative_results: "2x faster".to_string(),
                limitations: "not stated".to_string(),
                innovation_ideas: "combine with quantization".to_string(),
                improvement_category: "efficiency_optimization".to_string(),
            })
        }

        async fn suggest_keywords(&self, _topic: &str) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.keywords {
                Some(list) => Ok(list.clone()),
                None => Err(ResearchError::Parse("mock keyword outage".to_string())),
            }
        }

        fn usage(&self) -> UsageSnapshot {
            let calls = self.calls.load(Ordering::SeqCst);
            UsageSnapshot {
                api_calls: calls,
                prompt_tokens: calls * 100,
                completion_tokens: calls * 20,
                total_tokens: calls * 120,
            }
        }
    }

    /// Writes tiny placeholder files instead of downloading.
    struct MockDocs {
        dir: PathBuf,
        fail_ids: HashSet<String>,
    }

    impl MockDocs {
        fn new(dir: PathBuf) -> Self {
            Self {
                dir,
                fail_ids: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl DocumentFetcher for MockDocs {
        async fn fetch(&self, arxiv_id: &str, _pdf_url: &str) -> Result<PathBuf> {
            if self.fail_ids.contains(arxiv_id) {
                return Err(ResearchError::Pdf("mock download outage".to_string()));
            }
            let path = self.dir.join(format!("{arxiv_id}.pdf"));
            tokio::fs::write(&path, b"%PDF mock").await?;
            Ok(path)
        }

        async fn extract_text(&self, path: &Path) -> Result<String> {
            if !path.exists() {
                return Err(ResearchError::Pdf("mock file missing".to_string()));
            }
            Ok("Extracted mock body text".to_string())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        _dir: TempDir,
        store: Store,
        pipeline: Pipeline,
        search: Arc<MockSearch>,
        oracle: Arc<MockOracle>,
    }

    fn harness(search: MockSearch, oracle: MockOracle, config: FunnelConfig) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let docs = Arc::new(MockDocs::new(dir.path().to_path_buf()));
        harness_with_docs(dir, store, search, oracle, docs, config)
    }

    fn harness_with_docs(
        dir: TempDir,
        store: Store,
        search: MockSearch,
        oracle: MockOracle,
        docs: Arc<dyn DocumentFetcher>,
        config: FunnelConfig,
    ) -> Harness {
        let search = Arc::new(search);
        let oracle = Arc::new(oracle);
        let pipeline = Pipeline::new(
            store.clone(),
            search.clone(),
            oracle.clone(),
            docs,
            config,
        );
        Harness {
            _dir: dir,
            store,
            pipeline,
            search,
            oracle,
        }
    }

    fn small_config() -> FunnelConfig {
        FunnelConfig {
            max_search: 20,
            max_analysis: 5,
            relevance_threshold: 60.0,
            batch_size: 10,
            concurrency: 4,
        }
    }

    async fn seed_relevant(store: &Store, session: i64, position: usize, score: f64) -> String {
        let arxiv_id = mock_id(position);
        store
            .insert_paper(NewPaper {
                arxiv_id: arxiv_id.clone(),
                title: format!("Paper {arxiv_id}"),
                authors: "Ada Lovelace".to_string(),
                abstract_text: "Seeded abstract.".to_string(),
                published_date: Some("2024-01-10".to_string()),
                arxiv_url: format!("https://arxiv.org/abs/{arxiv_id}"),
                pdf_url: format!("https://arxiv.org/pdf/{arxiv_id}"),
                session_id: session,
            })
            .await
            .expect("insert");
        store
            .update_paper(
                &arxiv_id,
                PaperUpdate {
                    status: Some(PaperStatus::Relevant),
                    research_topic: Some(TOPIC.to_string()),
                    relevance_score: Some(score),
                    relevance_reason: Some(format!("scored {score}")),
                    ..PaperUpdate::default()
                },
            )
            .await
            .expect("update");
        arxiv_id
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_run_funnels_to_analysis() {
        // 20 results in pages of 10; six get real scores, one below the bar.
        let oracle = MockOracle::with_scores(&[
            (3, 91.0),
            (5, 72.0),
            (7, 65.0),
            (9, 58.0),
            (12, 84.0),
            (15, 77.0),
        ]);
        let h = harness(MockSearch::with_total(50), oracle, small_config());
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();

        let report = h
            .pipeline
            .run(session, TOPIC, &[TOPIC.to_string()], RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.discovered, 20);
        assert_eq!(report.relevant, 5);
        assert_eq!(report.irrelevant, 15);
        assert_eq!(report.selected, 5);
        assert_eq!(report.rank_excluded, 0);
        assert_eq!(report.downloaded, 5);
        assert_eq!(report.analyzed, 5);
        assert_eq!(report.analysis_failed, 0);

        // The ceiling stopped the search after two pages.
        assert_eq!(h.search.call_count(), 2);

        let analyzed = h.store.analyzed_papers(session).await.unwrap();
        assert_eq!(analyzed.len(), 5);
        for paper in &analyzed {
            assert_eq!(
                paper.improvement_category.as_deref(),
                Some("efficiency_optimization")
            );
            assert!(paper.analysis_json.is_some());
            assert!(paper.pdf_path.is_some());
        }

        let session_row = h.store.session(session).await.unwrap().expect("session");
        assert_eq!(session_row.total_found, 20);
        assert_eq!(session_row.relevant_count, 5);
        assert_eq!(session_row.analyzed_count, 5);
        assert!(session_row.api_calls > 0);
        assert!(session_row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_search_stops_once_quota_is_filled() {
        let oracle = MockOracle::with_scores(&[(1, 95.0), (2, 90.0)]);
        let mut config = small_config();
        config.max_search = 50;
        config.max_analysis = 2;
        let h = harness(MockSearch::with_total(50), oracle, config);
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();

        let report = h
            .pipeline
            .run(session, TOPIC, &[TOPIC.to_string()], RunOptions::default())
            .await
            .unwrap();

        // Both quota papers sit on the first page; no second page is fetched.
        assert_eq!(h.search.call_count(), 1);
        assert_eq!(report.discovered, 10);
        assert_eq!(report.relevant, 2);
        assert_eq!(report.analyzed, 2);
    }

    #[tokio::test]
    async fn test_second_run_stops_on_known_results() {
        let make_oracle = || MockOracle::with_scores(&[(1, 95.0)]);
        let h = harness(MockSearch::with_total(10), make_oracle(), small_config());

        let first = h.store.create_session(TOPIC, &[]).await.unwrap();
        let report = h
            .pipeline
            .run(first, TOPIC, &[TOPIC.to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.discovered, 10);

        // Same feed again under a new session: every result is already known.
        let second = h.store.create_session(TOPIC, &[]).await.unwrap();
        let report = h
            .pipeline
            .run(second, TOPIC, &[TOPIC.to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.discovered, 0);
        assert_eq!(report.relevant, 0);
    }

    #[tokio::test]
    async fn test_rank_overflow_demoted_with_note() {
        let h = harness(
            MockSearch::with_total(0),
            MockOracle::with_scores(&[]),
            FunnelConfig {
                max_analysis: 2,
                ..small_config()
            },
        );
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();

        // One clear winner and three tied papers; stable order breaks the tie.
        let a = seed_relevant(&h.store, session, 1, 90.0).await;
        let b = seed_relevant(&h.store, session, 2, 80.0).await;
        let c = seed_relevant(&h.store, session, 3, 80.0).await;
        let d = seed_relevant(&h.store, session, 4, 80.0).await;

        let report = h
            .pipeline
            .run(
                session,
                TOPIC,
                &[],
                RunOptions {
                    skip_search: true,
                    skip_screening: true,
                    skip_analysis: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.selected, 2);
        assert_eq!(report.rank_excluded, 2);
        assert_eq!(report.downloaded, 2);

        let winner = h.store.paper(&a).await.unwrap().expect("a");
        assert_eq!(winner.status, PaperStatus::Downloaded);
        let tied_in = h.store.paper(&b).await.unwrap().expect("b");
        assert_eq!(tied_in.status, PaperStatus::Downloaded);

        for (arxiv_id, position) in [(&c, 3), (&d, 4)] {
            let paper = h.store.paper(arxiv_id).await.unwrap().expect("demoted");
            assert_eq!(paper.status, PaperStatus::Irrelevant);
            let reason = paper.relevance_reason.expect("reason");
            // The original screening reason survives with the rank appended.
            assert!(reason.starts_with("scored 80"));
            assert!(reason.contains(&format!("position {position}")));
        }
    }

    #[tokio::test]
    async fn test_below_threshold_papers_keep_relevant_status() {
        let h = harness(
            MockSearch::with_total(0),
            MockOracle::with_scores(&[]),
            small_config(),
        );
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();

        let strong = seed_relevant(&h.store, session, 1, 85.0).await;
        let weak = seed_relevant(&h.store, session, 2, 45.0).await;

        let report = h
            .pipeline
            .run(
                session,
                TOPIC,
                &[],
                RunOptions {
                    skip_search: true,
                    skip_screening: true,
                    skip_analysis: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.selected, 1);
        assert_eq!(report.rank_excluded, 0);
        let strong_paper = h.store.paper(&strong).await.unwrap().expect("strong");
        assert_eq!(strong_paper.status, PaperStatus::Downloaded);
        // Below the bar is not the same as demoted: the paper stays relevant.
        let weak_paper = h.store.paper(&weak).await.unwrap().expect("weak");
        assert_eq!(weak_paper.status, PaperStatus::Relevant);
    }

    #[tokio::test]
    async fn test_download_failure_is_isolated() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let mut docs = MockDocs::new(dir.path().to_path_buf());
        docs.fail_ids.insert(mock_id(2));
        let h = harness_with_docs(
            dir,
            store,
            MockSearch::with_total(0),
            MockOracle::with_scores(&[]),
            Arc::new(docs),
            small_config(),
        );
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();
        for position in 1..=5 {
            seed_relevant(&h.store, session, position, 90.0).await;
        }

        let report = h
            .pipeline
            .run(
                session,
                TOPIC,
                &[],
                RunOptions {
                    skip_search: true,
                    skip_screening: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.downloaded, 4);
        assert_eq!(report.download_failed, 1);
        assert_eq!(report.analyzed, 4);

        let failed = h.store.paper(&mock_id(2)).await.unwrap().expect("failed");
        assert_eq!(failed.status, PaperStatus::DownloadFailed);
    }

    #[tokio::test]
    async fn test_screening_outage_degrades_single_paper() {
        let mut oracle = MockOracle::with_scores(&[(1, 95.0), (2, 88.0)]);
        oracle.fail_classify.insert(mock_id(2));
        let h = harness(MockSearch::with_total(3), oracle, small_config());
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();

        let report = h
            .pipeline
            .run(session, TOPIC, &[TOPIC.to_string()], RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.relevant, 1);
        assert_eq!(report.irrelevant, 2);

        let degraded = h.store.paper(&mock_id(2)).await.unwrap().expect("degraded");
        assert_eq!(degraded.status, PaperStatus::Irrelevant);
        assert_eq!(degraded.relevance_score, Some(0.0));
        assert!(degraded
            .relevance_reason
            .expect("reason")
            .starts_with("Screening failed"));
    }

    #[tokio::test]
    async fn test_analysis_failure_is_isolated() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("papers.db")).expect("open store");
        let docs = Arc::new(MockDocs::new(dir.path().to_path_buf()));
        let mut oracle = MockOracle::with_scores(&[]);
        oracle.fail_extract.insert(mock_id(3));
        let h = harness_with_docs(
            dir,
            store,
            MockSearch::with_total(0),
            oracle,
            docs,
            small_config(),
        );
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();
        for position in 1..=3 {
            seed_relevant(&h.store, session, position, 90.0).await;
        }

        let report = h
            .pipeline
            .run(
                session,
                TOPIC,
                &[],
                RunOptions {
                    skip_search: true,
                    skip_screening: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.downloaded, 3);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.analysis_failed, 1);

        let failed = h.store.paper(&mock_id(3)).await.unwrap().expect("failed");
        assert_eq!(failed.status, PaperStatus::AnalysisFailed);
    }

    #[tokio::test]
    async fn test_resume_screens_leftover_discovered() {
        let h = harness(
            MockSearch::with_total(0),
            MockOracle::with_scores(&[(1, 95.0)]),
            small_config(),
        );
        let session = h.store.create_session(TOPIC, &[]).await.unwrap();
        // Two papers stuck at discovered, as after an interrupted run.
        for position in 1..=2 {
            let arxiv_id = mock_id(position);
            h.store
                .insert_paper(NewPaper {
                    arxiv_id: arxiv_id.clone(),
                    title: format!("Paper {arxiv_id}"),
                    authors: "Ada Lovelace".to_string(),
                    abstract_text: "Leftover abstract.".to_string(),
                    published_date: None,
                    arxiv_url: format!("https://arxiv.org/abs/{arxiv_id}"),
                    pdf_url: format!("https://arxiv.org/pdf/{arxiv_id}"),
                    session_id: session,
                })
                .await
                .unwrap();
        }

        let report = h
            .pipeline
            .run(
                session,
                TOPIC,
                &[],
                RunOptions {
                    skip_search: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.relevant, 1);
        assert_eq!(report.irrelevant, 1);
        assert_eq!(report.analyzed, 1);
    }

    #[tokio::test]
    async fn test_resolve_keywords() {
        let h = harness(
            MockSearch::with_total(0),
            MockOracle::with_scores(&[]),
            small_config(),
        );

        // Explicit keywords win over suggestion.
        let explicit = vec!["linear attention".to_string()];
        assert_eq!(
            h.pipeline.resolve_keywords(TOPIC, &explicit, true).await,
            explicit
        );

        // Suggestion disabled: the raw topic is the only keyword.
        assert_eq!(
            h.pipeline.resolve_keywords(TOPIC, &[], false).await,
            vec![TOPIC.to_string()]
        );

        // Suggestion enabled: the oracle's list is used.
        assert_eq!(
            h.pipeline.resolve_keywords(TOPIC, &[], true).await,
            vec!["sparse attention".to_string()]
        );
        assert!(h.oracle.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_resolve_keywords_falls_back_on_outage() {
        let mut oracle = MockOracle::with_scores(&[]);
        oracle.keywords = None;
        let h = harness(MockSearch::with_total(0), oracle, small_config());

        assert_eq!(
            h.pipeline.resolve_keywords(TOPIC, &[], true).await,
            vec![TOPIC.to_string()]
        );
    }
}
