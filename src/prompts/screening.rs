//! Screening prompts for abstract-level relevance classification.
//!
//! Contains system and user prompt templates for scoring a paper against a
//! research topic from its title and abstract alone.

/// System prompt for abstract screening
pub const SYSTEM_PROMPT: &str = r#"You are an academic paper screening assistant. Your task is to judge how relevant a paper is to a given research topic, using ONLY the provided title and abstract.

Rules you MUST follow:
- Judge from the given text only; do NOT fabricate paper content.
- Scoring scale: 80-100 means the paper works directly on the topic; 61-79 means a closely related method, theory, or application; 40-60 means partially related; below 40 means unrelated.
- "is_relevant" is true only when the score is above 60.
- Output MUST be valid JSON only (no extra text), for machine parsing.

Output format (strict JSON, no markdown):
{
  "relevance_score": 0-100,
  "is_relevant": true | false,
  "reason": "Brief explanation in English"
}"#;

/// User prompt template for screening a single paper
/// Placeholders: {topic}, {title}, {abstract}
pub const USER_PROMPT_TEMPLATE: &str = r#"Determine how relevant the following paper is to the research topic.

Research topic: {topic}

Paper title: {title}

Paper abstract:
{abstract}

Output strict JSON only (no markdown code blocks, no extra text):
{
  "relevance_score": 0-100,
  "is_relevant": true | false,
  "reason": "Brief explanation"
}"#;

/// Build user prompt with paper data
pub fn build_user_prompt(topic: &str, title: &str, abstract_text: &str) -> String {
    USER_PROMPT_TEMPLATE
        .replace("{topic}", topic)
        .replace("{title}", title)
        .replace("{abstract}", abstract_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_user_prompt() {
        let prompt = build_user_prompt(
            "sparse attention efficiency",
            "Linear Attention Is All You Need",
            "We revisit attention complexity.",
        );
        assert!(prompt.contains("sparse attention efficiency"));
        assert!(prompt.contains("Linear Attention Is All You Need"));
        assert!(prompt.contains("We revisit attention complexity."));
        assert!(!prompt.contains("{topic}"));
    }
}
