//! Decision-oracle seam.
//!
//! The oracle is a language model reached over the network. Its replies are free
//! text and treated as untrusted input: every caller goes through
//! [`extract_json_object`] and validates the result before acting on it.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;

/// A message in the conversation sent to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleReply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl OracleReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn invoke(&self, conversation: &[ChatMessage]) -> Result<OracleReply>;
}

/// Call the oracle with a hard timeout, mapping every failure to [`EngineError::Oracle`].
pub async fn ask(
    oracle: &dyn DecisionOracle,
    conversation: &[ChatMessage],
    timeout: Duration,
) -> Result<String, EngineError> {
    match tokio::time::timeout(timeout, oracle.invoke(conversation)).await {
        Ok(Ok(reply)) => {
            if let Some(usage) = reply.usage {
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "oracle usage"
                );
            }
            Ok(reply.content)
        }
        Ok(Err(err)) => {
            warn!(err = %format!("{err:#}"), "oracle call failed");
            Err(EngineError::Oracle(format!("{err:#}")))
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "oracle call timed out");
            Err(EngineError::Oracle(format!(
                "timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// Pull the first JSON object out of free text.
///
/// Order: a fenced code block containing an object, then a brace-matching scan
/// over the raw text. Candidates that do not parse as a JSON object are skipped.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    if let Some(block) = fenced_block(raw)
        && let Some(value) = scan_objects(block)
    {
        return Some(value);
    }
    scan_objects(raw)
}

fn fenced_block(raw: &str) -> Option<&str> {
    let fence = "```";
    let start = raw.find(fence)?;
    let after_fence = &raw[start + fence.len()..];
    let after_lang = after_fence.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
    let end = after_lang.find(fence)?;
    let block = &after_lang[..end];
    block.contains('{').then_some(block)
}

fn scan_objects(text: &str) -> Option<Value> {
    for (start, _) in text.match_indices('{') {
        let Some(end) = matching_brace(&text[start..]) else {
            continue;
        };
        let candidate = &text[start..start + end + 1];
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
    }
    None
}

/// Byte offset of the brace closing the object that opens at offset 0.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Last-resort classification for replies with no JSON: does this read like a question to the user?
pub fn looks_like_question(text: &str) -> bool {
    if !text.contains('?') {
        return false;
    }
    let lower = text.to_lowercase();
    ["would you", "should i", "do you want", "could you", "can you confirm"]
        .iter()
        .any(|phrase| lower.contains(phrase))
}

/// Replace `"true"`/`"false"` strings with real booleans, recursively.
pub fn coerce_booleans(value: &mut Value) {
    match value {
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            if lowered == "true" {
                *value = Value::Bool(true);
            } else if lowered == "false" {
                *value = Value::Bool(false);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(coerce_booleans),
        Value::Object(map) => map.values_mut().for_each(coerce_booleans),
        _ => {}
    }
}
