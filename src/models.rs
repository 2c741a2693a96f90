//! Normalized request and response shapes.
//! Requests arrive from the transport layer already tagged with a virtual model id in `model`.
//! Fields the gateway does not interpret are carried in `extra` and forwarded untouched.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A normalized chat/completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    /// The virtual model requested by the caller. Rewritten to the concrete model id before a
    /// provider sees it.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    /// Request-level priority hint (`low`, `medium`, `high`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Explicit language tag, e.g. `fr` or `zh-CN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Transport headers and other routing hints. Never forwarded upstream.
    #[serde(default, skip_serializing)]
    pub metadata: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    /// Look up a metadata value by case-insensitive key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The most recent message sent by the user, if any.
    pub fn latest_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Message content is either a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of the content. Non-text parts contribute nothing.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Length of the textual content in characters.
    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(text) => text.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .map(|t| t.chars().count())
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A normalized chat/completion response.
///
/// Only the fields the gateway inspects are typed. Everything else is preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_unknown_fields() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "default",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.7
        }))
        .unwrap();

        assert_eq!(request.extra.get("temperature"), Some(&json!(0.7)));

        let serialized = serde_json::to_value(&request).unwrap();
        assert_eq!(serialized["temperature"], json!(0.7));
        assert!(serialized.get("metadata").is_none());
    }

    #[test]
    fn test_content_parts_text_length() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "default",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "héllo"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}},
                    {"type": "text", "text": "abc"}
                ]
            }]
        }))
        .unwrap();

        assert_eq!(request.messages[0].content.char_len(), 8);
        assert_eq!(request.messages[0].content.text(), "héllo\nabc");
    }

    #[test]
    fn test_latest_user_message_skips_assistant_turns() {
        let request = ChatRequest {
            model: "default".into(),
            messages: vec![
                ChatMessage::new("user", "first"),
                ChatMessage::new("user", "second"),
                ChatMessage::new("assistant", "reply"),
            ],
            ..Default::default()
        };

        assert_eq!(
            request.latest_user_message().unwrap().content.text(),
            "second"
        );
    }

    #[test]
    fn test_metadata_lookup_is_case_insensitive() {
        let mut request = ChatRequest::default();
        request
            .metadata
            .insert("X-Priority".to_string(), "high".to_string());

        assert_eq!(request.metadata_value("x-priority"), Some("high"));
        assert_eq!(request.metadata_value("x-language"), None);
    }
}
