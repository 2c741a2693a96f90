//! Request feature analysis.
//!
//! Derives the feature vector the scheduler scores targets against. Everything here is a
//! heuristic: ambiguous input falls back to the least restrictive classification (medium
//! priority, no extra capability) instead of failing.

use crate::models::ChatRequest;
use crate::target::capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Explicit request priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Parse a priority hint. Unrecognized values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" | "normal" => Some(Priority::Medium),
            "high" | "urgent" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

/// Ephemeral per-request features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFeatures {
    pub required_capabilities: BTreeSet<String>,
    /// Total characters across all message contents.
    pub context_length: usize,
    pub complexity: Complexity,
    pub priority: Priority,
    /// Non-capability requirements: `streaming`, `tool-use`, `json-mode`.
    pub special_requirements: BTreeSet<String>,
}

pub const STREAMING: &str = "streaming";
pub const TOOL_USE: &str = "tool-use";
pub const JSON_MODE: &str = "json-mode";

const LONG_CONTEXT_HEADER: &str = "x-long-context";
const PRIORITY_HEADER: &str = "x-priority";
const LANGUAGE_HEADER: &str = "x-language";

fn default_long_context_threshold() -> usize {
    4000
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

fn default_thinking_keywords() -> Vec<String> {
    words(&[
        "think",
        "reason",
        "step by step",
        "step-by-step",
        "let's work through",
        "prove",
        "derive",
    ])
}

fn default_code_keywords() -> Vec<String> {
    words(&[
        "code",
        "function",
        "program",
        "compile",
        "debug",
        "refactor",
        "```",
    ])
}

fn default_multilingual_keywords() -> Vec<String> {
    words(&["translate", "translation", "in english", "in chinese", "in french", "in spanish"])
}

fn default_long_context_keywords() -> Vec<String> {
    words(&["long-context", "long context"])
}

/// Keyword lists and thresholds. All matching is case-insensitive substring matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub long_context_threshold: usize,
    pub thinking_keywords: Vec<String>,
    pub code_keywords: Vec<String>,
    pub multilingual_keywords: Vec<String>,
    pub long_context_keywords: Vec<String>,
    /// Message count at or below which a request can be simple.
    pub simple_max_messages: usize,
    /// Message count above which a request is complex.
    pub complex_min_messages: usize,
    /// Context length below which a request can be simple.
    pub simple_max_chars: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            thinking_keywords: default_thinking_keywords(),
            code_keywords: default_code_keywords(),
            multilingual_keywords: default_multilingual_keywords(),
            long_context_keywords: default_long_context_keywords(),
            simple_max_messages: 2,
            complex_min_messages: 10,
            simple_max_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestFeatureAnalyzer {
    config: AnalyzerConfig,
}

impl RequestFeatureAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Derive the features of a request. Pure.
    pub fn analyze(&self, request: &ChatRequest) -> RequestFeatures {
        let context_length: usize = request.messages.iter().map(|m| m.content.char_len()).sum();

        let latest_user = request
            .latest_user_message()
            .map(|m| m.content.text().to_lowercase())
            .unwrap_or_default();

        let mut required_capabilities = BTreeSet::new();

        let long_context_flag = request
            .metadata_value(LONG_CONTEXT_HEADER)
            .is_some_and(is_truthy);
        if context_length > self.config.long_context_threshold
            || long_context_flag
            || contains_any(&latest_user, &self.config.long_context_keywords)
        {
            required_capabilities.insert(capability::LONG_CONTEXT.to_string());
        }

        if contains_any(&latest_user, &self.config.thinking_keywords) {
            required_capabilities.insert(capability::THINKING.to_string());
        }

        if contains_any(&latest_user, &self.config.code_keywords) {
            required_capabilities.insert(capability::CODE_GENERATION.to_string());
        }

        let language_tag = request
            .language
            .as_deref()
            .or_else(|| request.metadata_value(LANGUAGE_HEADER))
            .is_some_and(|tag| !tag.trim().is_empty());
        if language_tag || contains_any(&latest_user, &self.config.multilingual_keywords) {
            required_capabilities.insert(capability::MULTILINGUAL.to_string());
        }

        let priority = request
            .priority
            .as_deref()
            .or_else(|| request.metadata_value(PRIORITY_HEADER))
            .and_then(Priority::parse)
            .unwrap_or_default();

        let mut special_requirements = BTreeSet::new();
        if request.stream == Some(true) {
            special_requirements.insert(STREAMING.to_string());
        }
        if request.tools.as_ref().is_some_and(|tools| !tools.is_empty()) {
            special_requirements.insert(TOOL_USE.to_string());
        }
        if request
            .response_format
            .as_ref()
            .and_then(|format| format.get("type"))
            .and_then(|kind| kind.as_str())
            .is_some_and(|kind| kind.starts_with("json"))
        {
            special_requirements.insert(JSON_MODE.to_string());
        }

        RequestFeatures {
            required_capabilities,
            context_length,
            complexity: self.complexity(request.messages.len(), context_length),
            priority,
            special_requirements,
        }
    }

    /// The larger of the message-count bucket and the length bucket, so adding messages or
    /// characters never lowers the result.
    fn complexity(&self, message_count: usize, context_length: usize) -> Complexity {
        let by_messages = if message_count <= self.config.simple_max_messages {
            Complexity::Simple
        } else if message_count <= self.config.complex_min_messages {
            Complexity::Medium
        } else {
            Complexity::Complex
        };

        let by_length = if context_length < self.config.simple_max_chars {
            Complexity::Simple
        } else if context_length <= self.config.long_context_threshold {
            Complexity::Medium
        } else {
            Complexity::Complex
        };

        by_messages.max(by_length)
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .filter(|n| !n.is_empty())
        .any(|n| haystack.contains(&n.to_lowercase()))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
