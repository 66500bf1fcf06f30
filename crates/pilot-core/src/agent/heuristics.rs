//! Stateless heuristic computations over state snapshots: frame
//! fingerprinting, change detection, reward shaping, stuck detection.

use serde::{Deserialize, Serialize};

use super::state::{GameState, ScreenKind, VisualChange};
use crate::frame::Button;

/// Sampling stride over the base64 payload for fingerprinting.
const FINGERPRINT_STRIDE: usize = 1000;

pub const NAVIGATION_REWARD_PER_AREA: f64 = 0.005;
pub const HEALING_REWARD_FACTOR: f64 = 2.5;
pub const LEVEL_REWARD_FACTOR: f64 = 0.5;
const LEVEL_SOFT_CAP: f64 = 22.0;

/// Equality-only hash over the frame payload, sampled at a fixed stride.
/// Not cryptographic; two frames that differ only between sample points
/// can collide, which the change detector tolerates.
pub fn frame_fingerprint(payload: &str) -> u32 {
    let bytes = payload.as_bytes();
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += FINGERPRINT_STRIDE;
    }
    // Fold in the length so a strict prefix never collides with its parent.
    hash ^= bytes.len() as u32;
    hash.wrapping_mul(0x0100_0193)
}

pub fn visual_change(previous: Option<u32>, current: u32) -> VisualChange {
    match previous {
        None => VisualChange::FirstFrame,
        Some(prev) if prev == current => VisualChange::NoChange,
        Some(_) => VisualChange::ChangeDetected,
    }
}

/// Reward for newly visited area labels.
pub fn navigation_reward(newly_visited: usize) -> f64 {
    newly_visited as f64 * NAVIGATION_REWARD_PER_AREA
}

/// Reward proportional to the healed fraction of max HP. Damage earns
/// nothing; only positive deltas count.
pub fn healing_reward(hp_before: u32, hp_after: u32, hp_max: u32) -> f64 {
    if hp_max == 0 {
        return 0.0;
    }
    let gained = hp_after.saturating_sub(hp_before) as f64;
    HEALING_REWARD_FACTOR * gained / hp_max as f64
}

/// Level reward with diminishing returns above the soft cap. Only the
/// positive differential between two snapshots is rewarded.
pub fn level_reward(total_levels_before: u32, total_levels_after: u32) -> f64 {
    let shaped = |total: u32| -> f64 {
        let total = total as f64;
        LEVEL_REWARD_FACTOR * total.min((total - LEVEL_SOFT_CAP) / 4.0 + LEVEL_SOFT_CAP)
    };
    (shaped(total_levels_after) - shaped(total_levels_before)).max(0.0)
}

/// Integer reward for a named milestone's first occurrence; unknown
/// milestones earn nothing.
pub fn event_reward(milestone: &str) -> i64 {
    let m = milestone.trim().to_ascii_lowercase();
    if m == "champion" {
        return 50;
    }
    if m.contains("elite-four") || m.contains("elite_four") {
        return 10;
    }
    if m.starts_with("gym-") || m.contains("badge") {
        return 5;
    }
    if m.contains("cave") && m.contains("exit") {
        return 3;
    }
    0
}

/// Milestones earned by a state transition: badge gains, leaving a cave,
/// reaching the Elite Four or the champion. Names feed `event_reward`.
pub fn derive_milestones(previous: &GameState, current: &GameState) -> Vec<String> {
    let mut milestones = Vec::new();
    if current.badges > previous.badges {
        for n in (previous.badges + 1)..=current.badges {
            milestones.push(format!("gym-{n}"));
        }
    }
    let prev_area = previous.area.to_ascii_lowercase();
    let cur_area = current.area.to_ascii_lowercase();
    if prev_area.contains("cave") && !cur_area.is_empty() && cur_area != prev_area && !cur_area.contains("cave") {
        milestones.push(format!("{}-exit", slugify(&prev_area)));
    }
    if cur_area.contains("elite four") || cur_area.contains("elite-four") {
        milestones.push("elite-four-entry".to_string());
    }
    if cur_area.contains("hall of fame") || cur_area.contains("champion") {
        milestones.push("champion".to_string());
    }
    milestones
}

fn slugify(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// How the agent appears to be stuck, judged from the recent action tail.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    WallCollision,
    DialogueLoop,
    Unknown,
}

/// Classifies a stuck condition once `consecutive_no_change >= 3`,
/// looking at the most recent 3..5 actions (newest last).
pub fn classify_stuck(recent_actions: &[Button], consecutive_no_change: u32) -> Option<StuckKind> {
    if consecutive_no_change < 3 {
        return None;
    }
    let tail: Vec<Button> = recent_actions
        .iter()
        .rev()
        .take(5)
        .copied()
        .collect();

    let directional_run = tail
        .iter()
        .take_while(|b| Some(**b) == tail.first().copied() && b.is_directional())
        .count();
    if directional_run >= 3 {
        return Some(StuckKind::WallCollision);
    }

    let a_run = tail.iter().take_while(|b| **b == Button::A).count();
    if a_run >= 3 {
        return Some(StuckKind::DialogueLoop);
    }

    Some(StuckKind::Unknown)
}

/// What the agent should be doing right now, derived from game state.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAction {
    HealOrEscape,
    Battle,
    Progress,
    Explore,
}

const CRITICAL_HP_FRACTION: f64 = 0.2;

pub fn priority_action(state: &GameState) -> PriorityAction {
    if state.party_hp.max > 0 && state.party_hp.fraction() <= CRITICAL_HP_FRACTION {
        return PriorityAction::HealOrEscape;
    }
    if state.in_battle || state.screen_type == ScreenKind::Battle {
        return PriorityAction::Battle;
    }
    if state.in_dialogue || state.in_menu {
        return PriorityAction::Progress;
    }
    PriorityAction::Explore
}

impl PriorityAction {
    pub fn prompt_hint(&self) -> &'static str {
        match self {
            PriorityAction::HealOrEscape => {
                "Party HP is critical. Heal or escape before anything else."
            }
            PriorityAction::Battle => "You are in a battle. Fight or flee deliberately.",
            PriorityAction::Progress => "Advance through the current menu or dialogue.",
            PriorityAction::Explore => "Explore toward the current objective.",
        }
    }
}
