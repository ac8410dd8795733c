use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use task_agent::oracle::{ChatMessage, DecisionOracle, OracleReply, TokenUsage};

const DEFAULT_MODEL: &str = "gpt-5.2";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client used as the decision oracle.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiOracle {
    /// Reads `OPENAI_API_KEY`, plus optional `AGENT_MODEL` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        let model = std::env::var("AGENT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: Client::new(),
            api_key,
            model,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn invoke(&self, conversation: &[ChatMessage]) -> Result<OracleReply> {
        if conversation.len() > 40 {
            warn!(messages = conversation.len(), "conversation is long");
        }
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": conversation,
                "temperature": 0.2,
            }))
            .send()
            .await
            .context("send chat completion request")?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("decode chat completion response")?;
        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error");
            return Err(anyhow!("chat completion failed ({status}): {message}"));
        }
        let reply = parse_completion(&body)?;
        debug!(chars = reply.content.len(), "oracle replied");
        Ok(reply)
    }
}

fn parse_completion(body: &Value) -> Result<OracleReply> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow!("no content in completion: {body}"))?;
    let usage = body.get("usage").map(|usage| TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
    });
    Ok(OracleReply {
        content: content.to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_content_and_usage() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"action\":\"click\"}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let reply = parse_completion(&body).expect("reply");
        assert_eq!(reply.content, "{\"action\":\"click\"}");
        assert_eq!(reply.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn missing_content_is_an_error() {
        assert!(parse_completion(&json!({"choices": []})).is_err());
    }
}
