//! LLM oracle adapter: screening, deep analysis, and keyword suggestion.
//!
//! All three operations go through one OpenAI-compatible chat-completions
//! endpoint. The client accumulates token usage across calls, shares the
//! process-wide concurrency limiter, and retries transient failures per its
//! `RetryPolicy`. Screening parse failures degrade to a not-relevant verdict
//! inside the adapter; analysis parse failures surface as typed errors so
//! the orchestrator can mark the item failed.

use crate::error::{OptionExt, ResearchError, Result};
use crate::prompts::{analysis, keywords, screening};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Request timeout in seconds (analysis prompts carry large documents)
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Character budget for document text sent to the oracle
pub const MAX_DOCUMENT_CHARS: usize = 30_000;

/// Upper bound on suggested keywords
const MAX_KEYWORDS: usize = 5;

/// Sampling temperature for all oracle calls
const TEMPERATURE: f64 = 0.3;

/// Completion token cap for all oracle calls
const MAX_COMPLETION_TOKENS: u64 = 4000;

/// Sentinel for analysis fields the paper does not cover
pub const NOT_STATED: &str = "not stated";

// ============================================================================
// Result types
// ============================================================================

/// Outcome of screening one paper against a topic.
#[derive(Debug, Clone)]
pub struct Screening {
    /// Relevance score in [0, 100]
    pub score: f64,
    /// Whether the oracle considers the paper relevant
    pub pass: bool,
    /// Free-text justification
    pub rationale: String,
}

/// Fixed closed set of improvement directions for analyzed papers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImprovementCategory {
    MathematicalImprovement,
    StructuralImprovement,
    AdaptiveMethod,
    TheoreticalAnalysis,
    ApplicationExtension,
    EfficiencyOptimization,
    Other,
}

impl ImprovementCategory {
    pub const ALL: [ImprovementCategory; 7] = [
        ImprovementCategory::MathematicalImprovement,
        ImprovementCategory::StructuralImprovement,
        ImprovementCategory::AdaptiveMethod,
        ImprovementCategory::TheoreticalAnalysis,
        ImprovementCategory::ApplicationExtension,
        ImprovementCategory::EfficiencyOptimization,
        ImprovementCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementCategory::MathematicalImprovement => "mathematical_improvement",
            ImprovementCategory::StructuralImprovement => "structural_improvement",
            ImprovementCategory::AdaptiveMethod => "adaptive_method",
            ImprovementCategory::TheoreticalAnalysis => "theoretical_analysis",
            ImprovementCategory::ApplicationExtension => "application_extension",
            ImprovementCategory::EfficiencyOptimization => "efficiency_optimization",
            ImprovementCategory::Other => "other",
        }
    }

    /// Human-readable label for report headings.
    pub fn label(&self) -> &'static str {
        match self {
            ImprovementCategory::MathematicalImprovement => "Mathematical improvement",
            ImprovementCategory::StructuralImprovement => "Structural improvement",
            ImprovementCategory::AdaptiveMethod => "Adaptive methods",
            ImprovementCategory::TheoreticalAnalysis => "Theoretical analysis",
            ImprovementCategory::ApplicationExtension => "Application extension",
            ImprovementCategory::EfficiencyOptimization => "Efficiency optimization",
            ImprovementCategory::Other => "Other",
        }
    }

    /// Coerce a raw oracle value into the closed set.
    ///
    /// Anything outside the set becomes the catch-all; raw oracle output is
    /// never stored structurally unvalidated.
    pub fn coerce(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "mathematical_improvement" => ImprovementCategory::MathematicalImprovement,
            "structural_improvement" => ImprovementCategory::StructuralImprovement,
            "adaptive_method" | "adaptive_methods" => ImprovementCategory::AdaptiveMethod,
            "theoretical_analysis" => ImprovementCategory::TheoreticalAnalysis,
            "application_extension" => ImprovementCategory::ApplicationExtension,
            "efficiency_optimization" => ImprovementCategory::EfficiencyOptimization,
            _ => ImprovementCategory::Other,
        }
    }
}

impl fmt::Display for ImprovementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn not_stated() -> String {
    NOT_STATED.to_string()
}

fn other_category() -> String {
    ImprovementCategory::Other.as_str().to_string()
}

/// Structured extraction produced by deep analysis.
///
/// Every field the oracle omits defaults to the "not stated" sentinel; the
/// category is coerced into the closed set after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAnalysis {
    #[serde(default = "not_stated")]
    pub problem_definition: String,
    #[serde(default = "not_stated")]
    pub mathematical_modeling: String,
    #[serde(default = "not_stated")]
    pub core_innovation: String,
    #[serde(default = "not_stated")]
    pub theoretical_guarantee: String,
    #[serde(default = "not_stated")]
    pub experimental_design: String,
    #[serde(default = "not_stated")]
    pub quantitative_results: String,
    #[serde(default = "not_stated")]
    pub limitations: String,
    #[serde(default = "not_stated")]
    pub innovation_ideas: String,
    #[serde(default = "other_category")]
    pub improvement_category: String,
}

/// Cumulative oracle usage for the session aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub api_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Accumulated usage with atomic counters
#[derive(Debug, Default)]
struct AtomicUsage {
    api_calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl AtomicUsage {
    fn record_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tokens(&self, prompt: u64, completion: u64, total: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(total, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Oracle trait & client
// ============================================================================

/// The external classification/extraction capability.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Score a paper's relevance to `topic` from title and abstract.
    async fn classify(&self, topic: &str, title: &str, abstract_text: &str) -> Result<Screening>;

    /// Run the structured full-text extraction.
    async fn extract(&self, topic: &str, title: &str, document_text: &str)
        -> Result<PaperAnalysis>;

    /// Derive search keywords from a research topic.
    async fn suggest_keywords(&self, topic: &str) -> Result<Vec<String>>;

    /// Cumulative usage since the client was constructed.
    fn usage(&self) -> UsageSnapshot;
}

/// Oracle endpoint configuration
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// OpenAI-compatible API response structures
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Concrete oracle over an OpenAI-compatible chat-completions endpoint.
pub struct OracleClient {
    config: OracleConfig,
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    usage: AtomicUsage,
}

impl OracleClient {
    pub fn new(config: OracleConfig, limiter: Arc<Semaphore>, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            limiter,
            retry,
            usage: AtomicUsage::default(),
        })
    }

    /// One chat completion, holding a limiter permit across all retries.
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ResearchError::Config("concurrency limiter closed".to_string()))?;

        self.retry
            .run("oracle chat", || self.send_chat(system_prompt, user_prompt))
            .await
    }

    async fn send_chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.usage.record_call();

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_COMPLETION_TOKENS
        });

        let api_url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&api_url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request_body)
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
            let error_text = response.text().await.unwrap_or_default();
            return Err(ResearchError::Api {
                code: status.as_u16() as i32,
                message: format!("LLM API error: {} - {}", status, error_text),
            });
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ResearchError::Parse(format!("Failed to parse LLM response: {e}")))?;

        if let Some(usage) = &api_response.usage {
            self.usage
                .record_tokens(usage.prompt_tokens, usage.completion_tokens, usage.total_tokens);
        }

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_parse("LLM response contained no choices")?;
        Ok(choice.message.content)
    }
}

#[async_trait]
impl Oracle for OracleClient {
    async fn classify(&self, topic: &str, title: &str, abstract_text: &str) -> Result<Screening> {
        let user_prompt = screening::build_user_prompt(topic, title, abstract_text);
        let content = self.chat(screening::SYSTEM_PROMPT, &user_prompt).await?;
        Ok(parse_screening(&content))
    }

    async fn extract(
        &self,
        topic: &str,
        title: &str,
        document_text: &str,
    ) -> Result<PaperAnalysis> {
        let truncated = truncate_chars(document_text, MAX_DOCUMENT_CHARS);
        if truncated.len() < document_text.len() {
            debug!(
                budget = MAX_DOCUMENT_CHARS,
                "Document text truncated for analysis"
            );
        }
        let user_prompt = analysis::build_user_prompt(topic, title, truncated);
        let content = self.chat(analysis::SYSTEM_PROMPT, &user_prompt).await?;
        parse_analysis(&content)
    }

    async fn suggest_keywords(&self, topic: &str) -> Result<Vec<String>> {
        let user_prompt = keywords::build_user_prompt(topic);
        let content = self.chat(keywords::SYSTEM_PROMPT, &user_prompt).await?;
        parse_keywords(&content)
    }

    fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Parse a screening response; malformed output degrades to not-relevant.
fn parse_screening(content: &str) -> Screening {
    let json_str = extract_json(content);

    #[derive(Deserialize)]
    struct ScreeningOutput {
        relevance_score: f64,
        is_relevant: bool,
        #[serde(default)]
        reason: String,
    }

    match serde_json::from_str::<ScreeningOutput>(&json_str) {
        Ok(output) => Screening {
            score: output.relevance_score.clamp(0.0, 100.0),
            pass: output.is_relevant,
            rationale: output.reason,
        },
        Err(e) => {
            let preview: String = content.chars().take(200).collect();
            info!(
                error = %e,
                content_preview = %preview,
                "Screening output parse failed - treating as not relevant"
            );
            Screening {
                score: 0.0,
                pass: false,
                rationale: format!("Parse error: {e}"),
            }
        }
    }
}

/// Parse an analysis response; malformed output is a typed error.
fn parse_analysis(content: &str) -> Result<PaperAnalysis> {
    let json_str = extract_json(content);
    let mut parsed: PaperAnalysis = serde_json::from_str(&json_str)
        .map_err(|e| ResearchError::Parse(format!("Analysis output is not valid JSON: {e}")))?;
    parsed.improvement_category = ImprovementCategory::coerce(&parsed.improvement_category)
        .as_str()
        .to_string();
    Ok(parsed)
}

/// Parse a keyword-suggestion response.
fn parse_keywords(content: &str) -> Result<Vec<String>> {
    let json_str = extract_json(content);

    #[derive(Deserialize)]
    struct KeywordOutput {
        keywords: Vec<String>,
    }

    let output: KeywordOutput = serde_json::from_str(&json_str)
        .map_err(|e| ResearchError::Parse(format!("Keyword output is not valid JSON: {e}")))?;

    let cleaned: Vec<String> = output
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .take(MAX_KEYWORDS)
        .collect();
    if cleaned.is_empty() {
        return Err(ResearchError::Parse("keyword list was empty".to_string()));
    }
    Ok(cleaned)
}

/// Truncate to a character budget without splitting a UTF-8 code point.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json(content: &str) -> String {
    let trimmed = content.trim();

    // Check for markdown code block
    if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() >= 2 {
            let start = if lines[0].starts_with("```json") || lines[0] == "```" {
                1
            } else {
                0
            };
            let end = if lines.last().map(|l| l.trim()) == Some("```") {
                lines.len() - 1
            } else {
                lines.len()
            };
            return lines[start..end].join("\n");
        }
    }

    // Try to find JSON object in the text
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}
