//! Structured agent notes and the append-only decision log, layered on
//! the KV store with bounded sizes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::schema::NotesDelta;
use crate::frame::Button;
use crate::store::{agent_key, KvStore};

pub const DECISION_LOG_LIMIT: usize = 500;
pub const FAILED_ATTEMPTS_LIMIT: usize = 5;
/// Ceiling on any single notes field, keeping the stored object well
/// under the 5 KiB payload budget.
const NOTE_FIELD_MAX_CHARS: usize = 512;
const FAILED_ATTEMPT_MAX_CHARS: usize = 200;
pub const NOTES_PROMPT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StuckMode {
    #[default]
    None,
    PerimeterScan,
    WallHug,
    Backtrack,
}

impl StuckMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "none" => Some(StuckMode::None),
            "perimeter_scan" => Some(StuckMode::PerimeterScan),
            "wall_hug" => Some(StuckMode::WallHug),
            "backtrack" => Some(StuckMode::Backtrack),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StuckMode::None => "none",
            StuckMode::PerimeterScan => "perimeter_scan",
            StuckMode::WallHug => "wall_hug",
            StuckMode::Backtrack => "backtrack",
        }
    }
}

/// The persistent per-agent scratchpad the model reads and writes.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_found: Option<String>,
    #[serde(default)]
    pub stuck_mode: StuckMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_attempts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_discovery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<String>,
}

impl Notes {
    pub fn is_empty(&self) -> bool {
        *self == Notes::default()
    }

    /// Field-by-field overwrite; `failedAttempts` appends then truncates
    /// to the most recent five.
    pub fn merge(&mut self, delta: &NotesDelta) {
        if let Some(v) = &delta.current_objective {
            self.current_objective = Some(clip(v, NOTE_FIELD_MAX_CHARS));
        }
        if let Some(v) = &delta.last_known_location {
            self.last_known_location = Some(clip(v, NOTE_FIELD_MAX_CHARS));
        }
        if let Some(v) = &delta.exit_found {
            self.exit_found = Some(clip(v, NOTE_FIELD_MAX_CHARS));
        }
        if let Some(v) = &delta.stuck_mode {
            match StuckMode::parse(v) {
                Some(mode) => self.stuck_mode = mode,
                None => warn!(value = %v, "ignoring unknown stuckMode value"),
            }
        }
        if let Some(attempts) = &delta.failed_attempts {
            for attempt in attempts {
                let attempt = clip(attempt, FAILED_ATTEMPT_MAX_CHARS);
                if !attempt.is_empty() {
                    self.failed_attempts.push(attempt);
                }
            }
            let overflow = self.failed_attempts.len().saturating_sub(FAILED_ATTEMPTS_LIMIT);
            if overflow > 0 {
                self.failed_attempts.drain(..overflow);
            }
        }
        if let Some(v) = &delta.important_discovery {
            self.important_discovery = Some(clip(v, NOTE_FIELD_MAX_CHARS));
        }
        if let Some(v) = &delta.general {
            self.general = Some(clip(v, NOTE_FIELD_MAX_CHARS));
        }
    }
}

fn clip(value: &str, max_chars: usize) -> String {
    let value = value.trim();
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect()
}

/// One appended decision-log line.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionLogEntry {
    pub step: u64,
    pub button: Button,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic human-readable projection of the notes, truncated to
/// `limit` characters on a line boundary.
pub fn format_notes_for_prompt(notes: &Notes, limit: usize) -> String {
    let mut out = String::new();
    let mut push_line = |label: &str, value: &str| {
        if !value.is_empty() {
            out.push_str(label);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
    };

    push_line("Objective", notes.current_objective.as_deref().unwrap_or(""));
    push_line(
        "Last known location",
        notes.last_known_location.as_deref().unwrap_or(""),
    );
    push_line("Exit found", notes.exit_found.as_deref().unwrap_or(""));
    if notes.stuck_mode != StuckMode::None {
        push_line("Stuck mode", notes.stuck_mode.as_str());
    }
    for attempt in &notes.failed_attempts {
        push_line("Failed attempt", attempt);
    }
    push_line(
        "Discovery",
        notes.important_discovery.as_deref().unwrap_or(""),
    );
    push_line("Notes", notes.general.as_deref().unwrap_or(""));

    if out.len() <= limit {
        return out.trim_end().to_string();
    }
    // Keep whole lines only, up to the character budget.
    let mut kept = 0usize;
    for line in out.lines() {
        let next = kept + line.len() + 1;
        if next > limit {
            break;
        }
        kept = next;
    }
    out[..kept].trim_end().to_string()
}

/// Memory store: notes + decision log for one KV backend. All methods
/// are namespaced by agent id; no caller touches keys directly.
#[derive(Clone)]
pub struct MemoryStore {
    kv: Arc<dyn KvStore>,
}

impl MemoryStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn notes_key(agent_id: &str) -> String {
        agent_key(agent_id, "memstash")
    }

    fn log_key(agent_id: &str) -> String {
        agent_key(agent_id, "decisionlog")
    }

    /// Reads notes, accepting both the structured object and the legacy
    /// free-text form (which maps into the `general` field).
    pub async fn get_notes(&self, agent_id: &str) -> anyhow::Result<Notes> {
        let Some(raw) = self.kv.get(&Self::notes_key(agent_id)).await? else {
            return Ok(Notes::default());
        };
        match serde_json::from_str::<Notes>(&raw) {
            Ok(notes) => Ok(notes),
            Err(_) => Ok(Notes {
                general: Some(clip(&raw, NOTE_FIELD_MAX_CHARS)),
                ..Notes::default()
            }),
        }
    }

    pub async fn merge_notes(&self, agent_id: &str, delta: &NotesDelta) -> anyhow::Result<Notes> {
        let mut notes = self.get_notes(agent_id).await?;
        notes.merge(delta);
        let raw = serde_json::to_string(&notes)?;
        self.kv.set(&Self::notes_key(agent_id), raw, None).await?;
        Ok(notes)
    }

    pub async fn clear_notes(&self, agent_id: &str) -> anyhow::Result<()> {
        self.kv.del(&Self::notes_key(agent_id)).await?;
        Ok(())
    }

    /// Appends a log line with the next step number and truncates the
    /// log to its last `DECISION_LOG_LIMIT` entries.
    pub async fn append_decision_log(
        &self,
        agent_id: &str,
        button: Button,
        reasoning: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DecisionLogEntry> {
        let key = Self::log_key(agent_id);
        let step = self.kv.llen(&key).await? + 1;
        let entry = DecisionLogEntry {
            step,
            button,
            reasoning: clip(reasoning, NOTE_FIELD_MAX_CHARS),
            timestamp: now,
        };
        self.kv.rpush(&key, serde_json::to_string(&entry)?).await?;
        self.kv
            .ltrim(&key, -(DECISION_LOG_LIMIT as i64), -1)
            .await?;
        Ok(entry)
    }

    pub async fn decision_log(&self, agent_id: &str) -> anyhow::Result<Vec<DecisionLogEntry>> {
        let raw = self.kv.lrange(&Self::log_key(agent_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Clears notes and the decision log together. Best-effort when the
    /// backend cannot transact; callers observe both empty afterwards.
    pub async fn clear(&self, agent_id: &str) -> anyhow::Result<()> {
        self.kv.del(&Self::notes_key(agent_id)).await?;
        self.kv.del(&Self::log_key(agent_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn merge_overwrites_fields_and_keeps_others() {
        let store = store();
        store
            .merge_notes(
                "a1",
                &NotesDelta {
                    current_objective: Some("beat brock".to_string()),
                    general: Some("low on potions".to_string()),
                    ..NotesDelta::default()
                },
            )
            .await
            .unwrap();
        let notes = store
            .merge_notes(
                "a1",
                &NotesDelta {
                    current_objective: Some("reach pewter city".to_string()),
                    ..NotesDelta::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(notes.current_objective.as_deref(), Some("reach pewter city"));
        assert_eq!(notes.general.as_deref(), Some("low on potions"));
    }

    #[tokio::test]
    async fn merge_empty_delta_is_identity() {
        let store = store();
        let delta = NotesDelta {
            current_objective: Some("x".to_string()),
            ..NotesDelta::default()
        };
        let first = store.merge_notes("a1", &delta).await.unwrap();
        let second = store.merge_notes("a1", &NotesDelta::default()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_attempts_append_and_truncate_to_five() {
        let store = store();
        for i in 0..7 {
            store
                .merge_notes(
                    "a1",
                    &NotesDelta {
                        failed_attempts: Some(vec![format!("attempt-{i}")]),
                        ..NotesDelta::default()
                    },
                )
                .await
                .unwrap();
        }
        let notes = store.get_notes("a1").await.unwrap();
        assert_eq!(notes.failed_attempts.len(), FAILED_ATTEMPTS_LIMIT);
        assert_eq!(notes.failed_attempts[0], "attempt-2");
        assert_eq!(notes.failed_attempts[4], "attempt-6");
    }

    #[tokio::test]
    async fn legacy_free_text_notes_are_tolerated() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(
            "agent:a1:memstash",
            "remember: the gym is north".to_string(),
            None,
        )
        .await
        .unwrap();
        let store = MemoryStore::new(kv);
        let notes = store.get_notes("a1").await.unwrap();
        assert_eq!(notes.general.as_deref(), Some("remember: the gym is north"));
    }

    #[tokio::test]
    async fn unknown_stuck_mode_is_ignored() {
        let store = store();
        let notes = store
            .merge_notes(
                "a1",
                &NotesDelta {
                    stuck_mode: Some("wall_hug".to_string()),
                    ..NotesDelta::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(notes.stuck_mode, StuckMode::WallHug);
        let notes = store
            .merge_notes(
                "a1",
                &NotesDelta {
                    stuck_mode: Some("spin_in_circles".to_string()),
                    ..NotesDelta::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(notes.stuck_mode, StuckMode::WallHug);
    }

    #[tokio::test]
    async fn decision_log_steps_are_monotonic_and_bounded() {
        let store = store();
        for i in 0..3 {
            let entry = store
                .append_decision_log("a1", Button::A, &format!("r{i}"), Utc::now())
                .await
                .unwrap();
            assert_eq!(entry.step, i + 1);
        }
        let log = store.decision_log("a1").await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].step, 3);
    }

    #[tokio::test]
    async fn clear_empties_notes_and_log_together() {
        let store = store();
        store
            .merge_notes(
                "a1",
                &NotesDelta {
                    general: Some("x".to_string()),
                    ..NotesDelta::default()
                },
            )
            .await
            .unwrap();
        store
            .append_decision_log("a1", Button::A, "r", Utc::now())
            .await
            .unwrap();
        store.clear("a1").await.unwrap();
        assert!(store.get_notes("a1").await.unwrap().is_empty());
        assert!(store.decision_log("a1").await.unwrap().is_empty());
    }

    #[test]
    fn prompt_projection_truncates_on_line_boundary() {
        let notes = Notes {
            current_objective: Some("beat the elite four".to_string()),
            failed_attempts: vec!["x".repeat(400), "y".repeat(400), "z".repeat(400)],
            ..Notes::default()
        };
        let projected = format_notes_for_prompt(&notes, NOTES_PROMPT_LIMIT);
        assert!(projected.len() <= NOTES_PROMPT_LIMIT);
        assert!(projected.starts_with("Objective: beat the elite four"));
        // Every emitted line is complete.
        for line in projected.lines() {
            assert!(line.contains(": "));
        }
    }

    #[test]
    fn prompt_projection_of_empty_notes_is_empty() {
        assert_eq!(format_notes_for_prompt(&Notes::default(), 1000), "");
    }
}
