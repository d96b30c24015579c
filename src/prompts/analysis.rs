//! Deep-analysis prompts for structured full-text extraction.
//!
//! The oracle must answer with one JSON object whose fields mirror the
//! extraction columns of the paper record. Fields the paper does not cover
//! are filled with the literal sentinel "not stated" rather than omitted.

/// System prompt for full-text analysis
pub const SYSTEM_PROMPT: &str = r#"You are an academic paper analysis assistant. You read the full text of a research paper and produce a structured summary aimed at a researcher investigating a specific topic.

Rules you MUST follow:
- Ground every field in the paper text; quote or closely paraphrase, do NOT invent.
- If the paper does not state something, write exactly "not stated" for that field.
- "improvement_category" MUST be exactly one of: mathematical_improvement, structural_improvement, adaptive_method, theoretical_analysis, application_extension, efficiency_optimization, other.
- Output MUST be valid JSON only (no extra text), for machine parsing.

Output format (strict JSON, no markdown):
{
  "problem_definition": "what problem the paper formalizes and attacks",
  "mathematical_modeling": "the mathematical model or formulation used",
  "core_innovation": "the key new idea, in one or two sentences",
  "theoretical_guarantee": "stated theorems, bounds, or convergence results",
  "experimental_design": "datasets, baselines, and evaluation protocol",
  "quantitative_results": "headline numbers against baselines",
  "limitations": "limitations the authors state or that follow directly",
  "innovation_ideas": "2-3 follow-on research ideas grounded in the limitations",
  "improvement_category": "one of the fixed categories above"
}"#;

/// User prompt template for analyzing one paper
/// Placeholders: {topic}, {title}, {document}
pub const USER_PROMPT_TEMPLATE: &str = r#"Analyze the following paper for a researcher working on: {topic}

Paper title: {title}

Paper text (may be truncated):
{document}

Output strict JSON only (no markdown code blocks, no extra text) with the fields
problem_definition, mathematical_modeling, core_innovation, theoretical_guarantee,
experimental_design, quantitative_results, limitations, innovation_ideas,
improvement_category. Use "not stated" for anything the text does not cover."#;

/// Build user prompt with document text
pub fn build_user_prompt(topic: &str, title: &str, document: &str) -> String {
    USER_PROMPT_TEMPLATE
        .replace("{topic}", topic)
        .replace("{title}", title)
        .replace("{document}", document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_user_prompt() {
        let prompt = build_user_prompt("sparse attention", "Test Paper", "Full text here.");
        assert!(prompt.contains("sparse attention"));
        assert!(prompt.contains("Test Paper"));
        assert!(prompt.contains("Full text here."));
        assert!(!prompt.contains("{document}"));
    }
}
