//! Per-agent record, game state, and progress tracking.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frame::Button;

/// Lifecycle of one agent loop.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Acting,
    Paused,
    Error,
}

/// Screen classification as reported by the model (and the pre-analysis
/// phase). `Unknown` is the safe default on any classification failure.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScreenKind {
    Overworld,
    Battle,
    Menu,
    Dialogue,
    TextEntry,
    Transition,
    #[default]
    Unknown,
}

impl ScreenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenKind::Overworld => "overworld",
            ScreenKind::Battle => "battle",
            ScreenKind::Menu => "menu",
            ScreenKind::Dialogue => "dialogue",
            ScreenKind::TextEntry => "textEntry",
            ScreenKind::Transition => "transition",
            ScreenKind::Unknown => "unknown",
        }
    }
}

/// Whether the last executed input visibly changed the screen.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisualChange {
    FirstFrame,
    ChangeDetected,
    NoChange,
}

/// Running totals the reward shaping reads and writes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    /// Completed milestones, ordered by first-seen time. Monotonically
    /// growing within a run; cleared only by an explicit reset.
    #[serde(default)]
    pub milestones: Vec<String>,
    /// Visited area labels, ordered by first visit.
    #[serde(default)]
    pub visited_areas: Vec<String>,
    #[serde(default)]
    pub unique_area_count: u32,
    #[serde(default)]
    pub healing_reward_total: f64,
    #[serde(default)]
    pub level_reward_total: f64,
    #[serde(default)]
    pub consecutive_no_change: u32,
    #[serde(default)]
    pub last_effective_action: Option<Button>,
}

impl ProgressMetrics {
    /// Records a visit; returns true when the area is new for this run.
    pub fn visit_area(&mut self, area: &str) -> bool {
        let area = area.trim();
        if area.is_empty() || self.visited_areas.iter().any(|a| a == area) {
            return false;
        }
        self.visited_areas.push(area.to_string());
        self.unique_area_count = self.visited_areas.len() as u32;
        true
    }

    /// Records a milestone; returns true the first time it is seen.
    pub fn complete_milestone(&mut self, milestone: &str) -> bool {
        let milestone = milestone.trim();
        if milestone.is_empty() || self.milestones.iter().any(|m| m == milestone) {
            return false;
        }
        self.milestones.push(milestone.to_string());
        true
    }
}

/// Coarse party health summary surfaced to the heuristics.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartyHealth {
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub max: u32,
}

impl PartyHealth {
    pub fn fraction(&self) -> f64 {
        if self.max == 0 {
            return 1.0;
        }
        self.current as f64 / self.max as f64
    }
}

/// Game state as understood by the decision step. Mutated only by the
/// response merger; reinitialized on reset.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub in_battle: bool,
    #[serde(default)]
    pub in_menu: bool,
    #[serde(default)]
    pub in_dialogue: bool,
    #[serde(default)]
    pub in_text_entry: bool,
    #[serde(default)]
    pub screen_type: ScreenKind,
    #[serde(default)]
    pub badges: u32,
    #[serde(default)]
    pub pokemon_count: u32,
    #[serde(default)]
    pub party_hp: PartyHealth,
    #[serde(default)]
    pub progress: ProgressMetrics,
    #[serde(default)]
    pub last_input: Option<Button>,
}

/// One line of executed-command history shown to the model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameHistoryEntry {
    pub button: Button,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: u32,
    pub visual_change: VisualChange,
}

pub const FRAME_HISTORY_LIMIT: usize = 25;

/// Bounded history of executed inputs and their visual outcomes.
#[derive(Debug, Clone, Default)]
pub struct FrameHistory {
    entries: VecDeque<FrameHistoryEntry>,
}

impl FrameHistory {
    pub fn push(&mut self, entry: FrameHistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > FRAME_HISTORY_LIMIT {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameHistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent `n` executed buttons, newest last.
    pub fn recent_buttons(&self, n: usize) -> Vec<Button> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).map(|e| e.button).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The durable agent record published to the KV store after every
/// iteration and served by the state endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub model_id: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_decisions: u64,
    #[serde(default)]
    pub frame_count: u64,
    #[serde(default)]
    pub fallback_count: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens_in: u64,
    #[serde(default)]
    pub total_tokens_out: u64,
    #[serde(default)]
    pub game_state: GameState,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            status: AgentStatus::Idle,
            created_at: now,
            updated_at: now,
            total_decisions: 0,
            frame_count: 0,
            fallback_count: 0,
            total_cost: 0.0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            game_state: GameState::default(),
        }
    }
}
