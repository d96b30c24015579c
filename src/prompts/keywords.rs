//! Keyword-suggestion prompts for automatic search-term derivation.

/// System prompt for keyword suggestion
pub const SYSTEM_PROMPT: &str = r#"You are an academic search assistant. You turn a research topic into effective English search keywords for the arXiv preprint index. Output MUST be valid JSON only (no extra text)."#;

/// User prompt template for deriving keywords from a topic
/// Placeholder: {topic}
pub const USER_PROMPT_TEMPLATE: &str = r#"Generate 3-5 English search keyword phrases for the research topic below. Prefer established terminology over full sentences; each phrase should be 1-4 words.

Research topic: {topic}

Output strict JSON only (no markdown code blocks, no extra text):
{
  "keywords": ["first phrase", "second phrase"]
}"#;

/// Build user prompt for a topic
pub fn build_user_prompt(topic: &str) -> String {
    USER_PROMPT_TEMPLATE.replace("{topic}", topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_user_prompt() {
        let prompt = build_user_prompt("sparse attention efficiency");
        assert!(prompt.contains("sparse attention efficiency"));
        assert!(!prompt.contains("{topic}"));
    }
}
