//! Blob store boundary for checkpoints and milestone screenshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::kv::KvError;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobEntry {
    pub path: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub url: String,
}

/// Public-read blob storage. Failures are non-fatal for the loop; callers
/// log and continue.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes at `path` and returns a public URL.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, KvError>;
    /// Lists blobs under the prefix, oldest first.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, KvError>;
    /// Fetches a stored blob's bytes, `None` when absent.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, KvError>;
}

/// In-memory blob store used when no blob backend is configured.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<Vec<(String, Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn url_for(path: &str) -> String {
        format!("memory://blob/{path}")
    }

    /// Raw bytes for a stored path (test and parse-state support).
    pub fn get_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .iter()
            .rev()
            .find(|(p, _, _)| p == path)
            .map(|(_, b, _)| b.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, KvError> {
        let mut blobs = self.blobs.write();
        blobs.retain(|(p, _, _)| p != path);
        blobs.push((path.to_string(), bytes, Utc::now()));
        Ok(Self::url_for(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, KvError> {
        Ok(self
            .blobs
            .read()
            .iter()
            .filter(|(p, _, _)| p.starts_with(prefix))
            .map(|(p, b, at)| BlobEntry {
                path: p.clone(),
                size: b.len() as u64,
                uploaded_at: *at,
                url: Self::url_for(p),
            })
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.get_bytes(path))
    }
}

/// Replaces every character outside `[A-Za-z0-9-]` with `-`, for use in
/// checkpoint filenames.
pub fn model_safe_name(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Checkpoint blob path: `save-states/{agentId}/{date}_{time}_D{n}_{model}.state`.
pub fn checkpoint_path(
    agent_id: &str,
    decision_number: u64,
    model_id: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        "save-states/{agent_id}/{}_D{decision_number}_{}.state",
        now.format("%Y-%m-%d_%H-%M"),
        model_safe_name(model_id)
    )
}

/// Milestone screenshot path under the agent's milestone prefix.
pub fn milestone_path(agent_id: &str, milestone: &str, now: DateTime<Utc>) -> String {
    format!(
        "milestones/{agent_id}/{}_{}.png",
        model_safe_name(milestone),
        now.format("%Y-%m-%d_%H-%M")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn model_safe_name_replaces_punctuation() {
        assert_eq!(model_safe_name("openai/gpt-4o"), "openai-gpt-4o");
        assert_eq!(model_safe_name("a.b:c_d"), "a-b-c-d");
    }

    #[test]
    fn checkpoint_path_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 12).unwrap();
        assert_eq!(
            checkpoint_path("agent-1", 200, "openai/gpt-4o", now),
            "save-states/agent-1/2024-03-05_14-30_D200_openai-gpt-4o.state"
        );
    }

    #[tokio::test]
    async fn put_then_list_round_trips() {
        let store = MemoryBlobStore::new();
        let url = store.put("frames/a1/f1.png", vec![1, 2, 3]).await.unwrap();
        assert!(url.contains("frames/a1/f1.png"));
        let listed = store.list("frames/a1/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 3);
        assert_eq!(store.get_bytes("frames/a1/f1.png").unwrap(), vec![1, 2, 3]);
    }
}
