//! Runtime configuration from the environment. Read once at startup;
//! absent backends fall back to the in-memory stores.

use std::env;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8750";
pub const DEFAULT_MODEL_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const DEFAULT_AGENT_MODEL: &str = "openai/gpt-4o";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Remote KV backend; `None` selects the in-memory fallback.
    pub kv_url: Option<String>,
    pub kv_token: Option<String>,
    /// Blob backend token; `None` selects the in-memory fallback.
    pub blob_token: Option<String>,
    pub model_endpoint: String,
    pub model_api_key: Option<String>,
    /// Emulator control endpoint; when set together with `agent_id`,
    /// the runner hosts an autonomous loop against it.
    pub emulator_addr: Option<String>,
    pub agent_id: Option<String>,
    pub agent_model: String,
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: non_empty("PILOT_LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            kv_url: non_empty("PILOT_KV_URL"),
            kv_token: non_empty("PILOT_KV_TOKEN"),
            blob_token: non_empty("PILOT_BLOB_TOKEN"),
            model_endpoint: non_empty("PILOT_MODEL_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MODEL_ENDPOINT.to_string()),
            model_api_key: non_empty("PILOT_MODEL_API_KEY"),
            emulator_addr: non_empty("PILOT_EMULATOR_ADDR"),
            agent_id: non_empty("PILOT_AGENT_ID"),
            agent_model: non_empty("PILOT_AGENT_MODEL")
                .unwrap_or_else(|| DEFAULT_AGENT_MODEL.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            kv_url: None,
            kv_token: None,
            blob_token: None,
            model_endpoint: DEFAULT_MODEL_ENDPOINT.to_string(),
            model_api_key: None,
            emulator_addr: None,
            agent_id: None,
            agent_model: DEFAULT_AGENT_MODEL.to_string(),
        }
    }
}
