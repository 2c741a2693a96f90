//! Compatibility transforms
//!
//! Providers that are not quite OpenAI-shaped declare compatibility requirements in their
//! configuration. The selector picks a module that covers them and the pipeline runs every
//! request and response through it.

use crate::errors::ProviderError;
use crate::models::{ChatMessage, ChatRequest, ChatResponse, MessageContent};

pub trait CompatibilityModule: Send + Sync {
    /// Identifier. A requirement equal to this id selects the module directly.
    fn id(&self) -> &str;

    /// Requirement tags this module satisfies.
    fn supports(&self) -> &[&'static str];

    fn transform_request(&self, request: ChatRequest) -> Result<ChatRequest, ProviderError>;

    fn transform_response(&self, response: ChatResponse) -> Result<ChatResponse, ProviderError> {
        Ok(response)
    }
}

/// Leaves OpenAI-shaped traffic untouched.
#[derive(Debug, Clone, Default)]
pub struct PassthroughCompatibility;

impl CompatibilityModule for PassthroughCompatibility {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn supports(&self) -> &[&'static str] {
        &["openai", "openai-chat"]
    }

    fn transform_request(&self, request: ChatRequest) -> Result<ChatRequest, ProviderError> {
        Ok(request)
    }
}

/// For providers that reject the `system` role: system messages are folded into the first
/// user message.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptInlining;

impl CompatibilityModule for SystemPromptInlining {
    fn id(&self) -> &str {
        "system-prompt-inlining"
    }

    fn supports(&self) -> &[&'static str] {
        &["no-system-role"]
    }

    fn transform_request(&self, mut request: ChatRequest) -> Result<ChatRequest, ProviderError> {
        let (system, mut rest): (Vec<ChatMessage>, Vec<ChatMessage>) = request
            .messages
            .into_iter()
            .partition(|m| m.role == "system");

        if !system.is_empty() {
            let preamble = system
                .iter()
                .map(|m| m.content.text())
                .collect::<Vec<_>>()
                .join("\n\n");

            match rest.iter_mut().find(|m| m.role == "user") {
                Some(first_user) => {
                    let text = format!("{preamble}\n\n{}", first_user.content.text());
                    first_user.content = MessageContent::Text(text);
                }
                None => rest.insert(0, ChatMessage::new("user", preamble)),
            }
        }

        request.messages = rest;
        Ok(request)
    }
}
