//! Per-run button accounting owned by the coordinator: consecutive-press
//! counters, no-change penalties, and the press-count ban window. The
//! model never sees this state directly, only the projected hint lists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::state::VisualChange;
use crate::frame::Button;

/// Consecutive-press thresholds that publish an "avoid" hint.
const START_SELECT_AVOID_AFTER: u32 = 2; // strictly greater
const WAIT_AVOID_AT: u32 = 3;
const B_AVOID_AT: u32 = 5;

/// No-change penalty: after this many consecutive `no_change` outcomes a
/// button's reported confidence is floored and it joins buttonsToAvoid.
const NO_CHANGE_PENALTY_AT: u32 = 5;
pub const NO_CHANGE_CONFIDENCE_FLOOR: f64 = 0.20;

/// Ban policy: total presses within a run that trigger a ban, and how
/// many prompts the ban lasts.
const BAN_PRESS_THRESHOLD: u32 = 10;
const BAN_PROMPTS: u32 = 2;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ButtonStats {
    consecutive_start_select: u32,
    consecutive_wait: u32,
    consecutive_b: u32,
    no_change_counts: BTreeMap<Button, u32>,
    press_totals: BTreeMap<Button, u32>,
    buttons_to_avoid: Vec<Button>,
    /// button -> prompts remaining before automatic eviction.
    banned: BTreeMap<Button, u32>,
}

impl ButtonStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an executed press: bumps the total for the button, advances
    /// the matching consecutive counter and resets the others, and opens a
    /// ban window when the total crosses the threshold.
    pub fn note_press(&mut self, button: Button) {
        match button {
            Button::Start | Button::Select => {
                self.consecutive_start_select = self.consecutive_start_select.saturating_add(1);
                self.consecutive_wait = 0;
                self.consecutive_b = 0;
            }
            Button::Wait => {
                self.consecutive_wait = self.consecutive_wait.saturating_add(1);
                self.consecutive_start_select = 0;
                self.consecutive_b = 0;
            }
            Button::B => {
                self.consecutive_b = self.consecutive_b.saturating_add(1);
                self.consecutive_start_select = 0;
                self.consecutive_wait = 0;
            }
            _ => {
                self.consecutive_start_select = 0;
                self.consecutive_wait = 0;
                self.consecutive_b = 0;
            }
        }

        let total = self.press_totals.entry(button).or_insert(0);
        *total += 1;
        if *total >= BAN_PRESS_THRESHOLD {
            *total = 0;
            self.banned.insert(button, BAN_PROMPTS);
        }
    }

    /// Records the visual outcome of the prior press. Five consecutive
    /// `no_change` outcomes floor the button's reported confidence and add
    /// it to buttonsToAvoid; any `change_detected` clears both.
    pub fn note_outcome(&mut self, button: Button, change: VisualChange) {
        match change {
            VisualChange::NoChange => {
                let count = self.no_change_counts.entry(button).or_insert(0);
                *count = count.saturating_add(1);
                if *count >= NO_CHANGE_PENALTY_AT && !self.buttons_to_avoid.contains(&button) {
                    self.buttons_to_avoid.push(button);
                }
            }
            VisualChange::ChangeDetected => {
                self.no_change_counts.remove(&button);
                self.buttons_to_avoid.retain(|b| *b != button);
            }
            VisualChange::FirstFrame => {}
        }
    }

    pub fn avoid_start_select(&self) -> bool {
        self.consecutive_start_select > START_SELECT_AVOID_AFTER
    }

    pub fn avoid_wait(&self) -> bool {
        self.consecutive_wait >= WAIT_AVOID_AT
    }

    pub fn avoid_b(&self) -> bool {
        self.consecutive_b >= B_AVOID_AT
    }

    pub fn buttons_to_avoid(&self) -> &[Button] {
        &self.buttons_to_avoid
    }

    /// True when the button's confidence must be floored in the
    /// "previous scores" context shown to the model.
    pub fn is_penalized(&self, button: Button) -> bool {
        self.no_change_counts
            .get(&button)
            .is_some_and(|c| *c >= NO_CHANGE_PENALTY_AT)
    }

    /// Applies the no-change confidence floor to a previous-scores value.
    pub fn floored_confidence(&self, button: Button, previous: f64) -> f64 {
        if self.is_penalized(button) {
            previous.min(NO_CHANGE_CONFIDENCE_FLOOR)
        } else {
            previous
        }
    }

    /// Floors every penalized button in a previous-scores table.
    pub fn apply_floors(
        &self,
        mut scores: crate::agent::schema::ButtonScores,
    ) -> crate::agent::schema::ButtonScores {
        for button in crate::frame::ALL_BUTTONS {
            scores.set(button, self.floored_confidence(button, scores.get(button)));
        }
        scores
    }

    /// Buttons banned for the upcoming prompt. Consumes one prompt from
    /// each ban window and evicts exhausted entries, so callers invoke
    /// this exactly once per prompt build.
    pub fn banned_for_prompt(&mut self) -> Vec<Button> {
        let banned: Vec<Button> = self.banned.keys().copied().collect();
        self.banned.retain(|_, remaining| {
            *remaining -= 1;
            *remaining > 0
        });
        banned
    }

    /// Currently banned buttons without consuming the window (state
    /// publication, diagnostics).
    pub fn banned_snapshot(&self) -> Vec<Button> {
        self.banned.keys().copied().collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
