//! Vision model boundary: an opaque request/response client plus the
//! per-model cost table used for decision accounting.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Token counts for one model call. When the provider omits usage, the
/// caller estimates from character counts so accounting never skips.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// One inference request: text plus zero or more PNG data URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub user_text: String,
    /// PNG data URLs, oldest first; the current frame is last.
    pub images: Vec<String>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Boundary to the model provider. The in-flight future must abort the
/// underlying request when dropped so coordinator deadlines release
/// sockets.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: ModelRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ModelReply>> + Send + 'a>>;
}

/// (input $/1K tokens, output $/1K tokens) for a model identifier.
/// Unknown models fall back to a conservative default row.
pub fn model_rates(model: &str) -> (f64, f64) {
    match model {
        "openai/gpt-4o" => (0.0025, 0.01),
        "openai/gpt-4o-mini" => (0.00015, 0.0006),
        "anthropic/claude-3.5-sonnet" => (0.003, 0.015),
        "anthropic/claude-3-haiku" => (0.00025, 0.00125),
        "google/gemini-flash-1.5" => (0.000075, 0.0003),
        "google/gemini-pro-1.5" => (0.00125, 0.005),
        _ => (0.003, 0.015),
    }
}

/// Dollar cost of one call at the model's published rates.
pub fn cost_for(model: &str, usage: TokenUsage) -> f64 {
    let (input, output) = model_rates(model);
    usage.prompt_tokens as f64 / 1000.0 * input + usage.completion_tokens as f64 / 1000.0 * output
}

/// Rough token estimate for usage-less replies: ~4 chars per token.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

// --- OpenAI-compatible chat-completions provider ---

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    /// Full endpoint URL, e.g. `https://openrouter.ai/api/v1/chat/completions`.
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: ChatContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ChatContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Provider client speaking the OpenAI-compatible chat contract with
/// image content parts and a JSON response format.
pub struct ChatCompletionsClient {
    cfg: ChatCompletionsConfig,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(cfg: ChatCompletionsConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, request: ModelRequest) -> anyhow::Result<ModelReply> {
        let mut parts = vec![ContentPart::Text {
            text: &request.user_text,
        }];
        for image in &request.images {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl { url: image },
            });
        }

        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: ChatContent::Text(&request.system),
                },
                ChatMessage {
                    role: "user",
                    content: ChatContent::Parts(parts),
                },
            ],
            max_tokens: request.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let res = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .context("model request failed")?
            .error_for_status()
            .context("model non-2xx response")?
            .json::<ChatResponse>()
            .await
            .context("model response decode failed")?;

        let text = res
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("model response has no choices"))?;

        Ok(ModelReply {
            text,
            usage: res.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }
}

impl ModelClient for ChatCompletionsClient {
    fn complete<'a>(
        &'a self,
        request: ModelRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ModelReply>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_uses_per_model_rates() {
        let usage = TokenUsage::new(1000, 1000);
        let cost = cost_for("openai/gpt-4o", usage);
        assert!((cost - 0.0125).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_default_rates() {
        let usage = TokenUsage::new(2000, 500);
        let cost = cost_for("vendor/imaginary", usage);
        assert!((cost - (2.0 * 0.003 + 0.5 * 0.015)).abs() < 1e-9);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(9), 3);
    }
}
