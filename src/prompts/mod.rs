//! Prompt module for LLM-based operations.
//!
//! This module provides modular prompt templates for the three oracle calls:
//! abstract screening, full-text analysis, and keyword suggestion.

pub mod analysis;
pub mod keywords;
pub mod screening;
