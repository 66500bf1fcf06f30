//! The decision step: two-phase model call, structured-output
//! validation, sequence derivation, and the canonical fallback path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::heuristics::{PriorityAction, StuckKind};
use super::prompt;
use super::schema::{
    parse_decision_reply, parse_screen_type_reply, ButtonScores, GameStateDelta, NotesDelta,
    ScreenTypeReply,
};
use super::state::{GameState, PartyHealth};
use crate::frame::{Button, CapturedFrame};
use crate::model::{cost_for, estimate_tokens, ModelClient, ModelRequest, TokenUsage};

pub const SCREEN_PHASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DECISION_PHASE_TIMEOUT: Duration = Duration::from_secs(60);
pub const SCREEN_PHASE_MAX_TOKENS: u32 = 100;
pub const DECISION_PHASE_MAX_TOKENS: u32 = 1000;
/// Steps after the first execute only at or above this argmax confidence.
pub const SEQUENCE_STEP_THRESHOLD: f64 = 0.85;
/// Estimated usage charged for fallback decisions so cost accounting is
/// never silently skipped.
pub const FALLBACK_PROMPT_TOKENS: u64 = 1500;
pub const FALLBACK_COMPLETION_TOKENS: u64 = 100;

/// Everything the decision step needs for one iteration.
#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub agent_id: String,
    pub model_id: String,
    pub frame: CapturedFrame,
    /// Up to the 2 most recent prior frames (data URLs), oldest first.
    pub previous_frames: Vec<String>,
    /// Preformatted history lines with change indicators.
    pub command_history: Vec<String>,
    /// Previous per-button confidences with penalty floors applied.
    pub previous_scores: Option<ButtonScores>,
    /// Last model comments, oldest first.
    pub dialog_history: Vec<String>,
    pub avoid_start_select: bool,
    pub avoid_wait: bool,
    pub avoid_b: bool,
    pub buttons_to_avoid: Vec<Button>,
    pub banned_buttons: Vec<Button>,
    pub notes_projection: String,
    pub game_state: GameState,
    pub recent_decisions: Vec<DecisionSummary>,
    pub priority: PriorityAction,
    pub stuck: Option<StuckKind>,
    /// Pre-analyzed screen kind; when present the screen-type phase is
    /// skipped.
    pub screen_hint: Option<ScreenTypeReply>,
}

pub const PREVIOUS_FRAMES_LIMIT: usize = 2;
pub const DIALOG_HISTORY_LIMIT: usize = 10;
pub const RECENT_DECISIONS_LIMIT: usize = 5;

impl DecisionInputs {
    /// Enforces the resource bounds on history-shaped fields, keeping
    /// the most recent entries.
    pub fn normalize(mut self) -> Self {
        truncate_front(&mut self.previous_frames, PREVIOUS_FRAMES_LIMIT);
        truncate_front(&mut self.dialog_history, DIALOG_HISTORY_LIMIT);
        truncate_front(&mut self.recent_decisions, RECENT_DECISIONS_LIMIT);
        self
    }
}

fn truncate_front<T>(items: &mut Vec<T>, limit: usize) {
    let overflow = items.len().saturating_sub(limit);
    if overflow > 0 {
        items.drain(..overflow);
    }
}

/// Compressed view of a prior decision shown to the model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSummary {
    pub button: Button,
    pub reasoning: String,
}

/// The executed decision, as persisted and returned over HTTP.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub button: Button,
    pub confidence: f64,
    pub confidence_scores: ButtonScores,
    pub screen_analysis: String,
    pub reasoning: String,
    #[serde(
        default,
        rename = "personality_comment",
        skip_serializing_if = "Option::is_none"
    )]
    pub personality_comment: Option<String>,
    pub button_sequence: Vec<ButtonScores>,
    /// Buttons actually scheduled for execution, derived from the
    /// sequence. Never empty.
    pub execution_plan: Vec<Button>,
    pub progress_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<NotesDelta>,
    pub is_fallback: bool,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one decision step, including accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub game_state: GameState,
    pub screen: ScreenTypeReply,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// From the validated sequence, picks the primary button (step 1 argmax)
/// and extends with steps whose argmax clears the threshold; stops at
/// the first step below it. Always yields at least one element.
pub fn derive_execution_plan(sequence: &[ButtonScores]) -> Vec<Button> {
    let mut plan = Vec::new();
    for (i, step) in sequence.iter().enumerate() {
        let (button, confidence) = step.argmax();
        if i == 0 {
            plan.push(button);
            continue;
        }
        if confidence < SEQUENCE_STEP_THRESHOLD {
            break;
        }
        plan.push(button);
    }
    if plan.is_empty() {
        plan.push(Button::Wait);
    }
    plan
}

/// Applies the model's asserted fields over the previous state. Only
/// asserted fields move; everything else carries forward.
pub fn merge_game_state(
    previous: &GameState,
    delta: &GameStateDelta,
    screen: &ScreenTypeReply,
    executed: Button,
) -> GameState {
    let mut state = previous.clone();
    if let Some(area) = &delta.area {
        let area = area.trim();
        if !area.is_empty() {
            state.area = area.to_string();
            state.progress.visit_area(area);
        }
    }
    if let Some(v) = delta.in_battle {
        state.in_battle = v;
    }
    if let Some(v) = delta.in_menu {
        state.in_menu = v;
    }
    if let Some(v) = delta.in_dialogue {
        state.in_dialogue = v;
    }
    if let Some(v) = delta.in_text_entry {
        state.in_text_entry = v;
    }
    if let Some(v) = delta.pokemon_count {
        state.pokemon_count = v;
    }
    if let Some(v) = delta.badges {
        state.badges = v;
    }
    state.screen_type = delta.screen_type.unwrap_or(screen.screen_type);
    if let Some(hp) = delta.estimated_party_hp {
        // Fractions in [0, 1]; larger values are percentages.
        let percent = if hp <= 1.0 { hp * 100.0 } else { hp };
        state.party_hp = PartyHealth {
            current: percent.clamp(0.0, 100.0).round() as u32,
            max: 100,
        };
    }
    state.last_input = Some(executed);
    state
}

/// The canonical WAIT decision used when the model cannot produce a
/// valid structured reply.
pub fn fallback_decision(now: DateTime<Utc>, reason: &str) -> Decision {
    let scores = ButtonScores::fallback();
    Decision {
        button: Button::Wait,
        confidence: 0.5,
        confidence_scores: scores,
        screen_analysis: String::new(),
        reasoning: format!("fallback: {reason}"),
        personality_comment: None,
        button_sequence: vec![scores],
        execution_plan: vec![Button::Wait],
        progress_confidence: 0.0,
        notes: None,
        is_fallback: true,
        timestamp: now,
    }
}

/// Runs the two model phases for one iteration.
pub struct DecisionStep {
    model: Arc<dyn ModelClient>,
}

impl DecisionStep {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Screen-type phase. Any failure (transport, schema, timeout)
    /// yields `unknown` and the loop continues.
    pub async fn classify_screen(
        &self,
        model_id: &str,
        frame: &CapturedFrame,
        context: &str,
    ) -> (ScreenTypeReply, TokenUsage) {
        let request = ModelRequest {
            model: model_id.to_string(),
            system: prompt::SCREEN_TYPE_SYSTEM.to_string(),
            user_text: prompt::build_screen_type_prompt(context),
            images: vec![frame.data_url.clone()],
            max_tokens: SCREEN_PHASE_MAX_TOKENS,
        };
        let prompt_chars = request.user_text.len();

        let reply = match tokio::time::timeout(SCREEN_PHASE_TIMEOUT, self.model.complete(request))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "screen-type phase failed");
                return (ScreenTypeReply::default(), TokenUsage::default());
            }
            Err(_) => {
                warn!("screen-type phase timed out");
                return (ScreenTypeReply::default(), TokenUsage::default());
            }
        };

        let usage = reply.usage.unwrap_or_else(|| {
            TokenUsage::new(estimate_tokens(prompt_chars), estimate_tokens(reply.text.len()))
        });
        match parse_screen_type_reply(&reply.text) {
            Ok(parsed) => (parsed, usage),
            Err(err) => {
                warn!(error = %err, "screen-type reply did not validate");
                (ScreenTypeReply::default(), usage)
            }
        }
    }

    /// Full decision phase. Model errors, schema violations, and
    /// timeouts all land on the fallback decision with estimated usage.
    pub async fn decide(&self, inputs: DecisionInputs, now: DateTime<Utc>) -> DecisionOutcome {
        let inputs = inputs.normalize();

        let (screen, mut usage) = match &inputs.screen_hint {
            Some(hint) => (hint.clone(), TokenUsage::default()),
            None => {
                self.classify_screen(&inputs.model_id, &inputs.frame, &inputs.game_state.area)
                    .await
            }
        };

        let user_text = prompt::build_decision_prompt(&inputs, &screen);
        let prompt_chars = user_text.len();
        let mut images = inputs.previous_frames.clone();
        images.push(inputs.frame.data_url.clone());
        let request = ModelRequest {
            model: inputs.model_id.clone(),
            system: prompt::DECISION_SYSTEM.to_string(),
            user_text,
            images,
            max_tokens: DECISION_PHASE_MAX_TOKENS,
        };

        let reply = match tokio::time::timeout(DECISION_PHASE_TIMEOUT, self.model.complete(request))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "decision phase failed");
                return self.fallback_outcome(&inputs, screen, usage, now, "model error");
            }
            Err(_) => {
                warn!("decision phase timed out");
                return self.fallback_outcome(&inputs, screen, usage, now, "model timeout");
            }
        };

        let phase_usage = reply.usage.unwrap_or_else(|| {
            TokenUsage::new(estimate_tokens(prompt_chars), estimate_tokens(reply.text.len()))
        });
        usage.prompt_tokens += phase_usage.prompt_tokens;
        usage.completion_tokens += phase_usage.completion_tokens;

        let parsed = match parse_decision_reply(&reply.text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "decision reply did not validate");
                return self.fallback_outcome(&inputs, screen, usage, now, "schema violation");
            }
        };

        let sequence = parsed.decision.button_sequence;
        let plan = derive_execution_plan(&sequence);
        let (button, confidence) = sequence[0].argmax();
        debug!(button = %button, confidence, steps = plan.len(), "decision derived");

        let decision = Decision {
            button,
            confidence,
            confidence_scores: sequence[0],
            screen_analysis: parsed.decision.screen_analysis,
            reasoning: parsed.decision.reasoning,
            personality_comment: parsed
                .decision
                .personality_comment
                .filter(|c| !c.trim().is_empty()),
            button_sequence: sequence,
            execution_plan: plan,
            progress_confidence: parsed.decision.progress_confidence,
            notes: parsed.decision.notes,
            is_fallback: false,
            timestamp: now,
        };

        let game_state = merge_game_state(&inputs.game_state, &parsed.game_state, &screen, button);
        let cost = cost_for(&inputs.model_id, usage);

        DecisionOutcome {
            decision,
            game_state,
            screen,
            usage,
            cost,
        }
    }

    fn fallback_outcome(
        &self,
        inputs: &DecisionInputs,
        screen: ScreenTypeReply,
        phase_usage: TokenUsage,
        now: DateTime<Utc>,
        reason: &str,
    ) -> DecisionOutcome {
        let usage = TokenUsage::new(
            phase_usage.prompt_tokens + FALLBACK_PROMPT_TOKENS,
            phase_usage.completion_tokens + FALLBACK_COMPLETION_TOKENS,
        );
        let decision = fallback_decision(now, reason);
        let game_state = merge_game_state(
            &inputs.game_state,
            &GameStateDelta::default(),
            &screen,
            decision.button,
        );
        let cost = cost_for(&inputs.model_id, usage);
        DecisionOutcome {
            decision,
            game_state,
            screen,
            usage,
            cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::ScreenKind;
    use crate::testutil::{png_data_url, FakeModel};

    fn base_inputs() -> DecisionInputs {
        DecisionInputs {
            agent_id: "agent-1".to_string(),
            model_id: "openai/gpt-4o".to_string(),
            frame: CapturedFrame::from_data_url(png_data_url(2048), Utc::now()).unwrap(),
            previous_frames: vec![],
            command_history: vec![],
            previous_scores: None,
            dialog_history: vec![],
            avoid_start_select: false,
            avoid_wait: false,
            avoid_b: false,
            buttons_to_avoid: vec![],
            banned_buttons: vec![],
            notes_projection: String::new(),
            game_state: GameState::default(),
            recent_decisions: vec![],
            priority: PriorityAction::Explore,
            stuck: None,
            screen_hint: None,
        }
    }

    fn decision_json(primary: &str, score: f64) -> String {
        format!(
            r#"{{"gameState":{{"area":"pallet-town","screenType":"overworld"}},
               "decision":{{"screenAnalysis":"town","reasoning":"go","buttonSequence":[{{"{primary}":{score}}}],"progressConfidence":0.6}}}}"#
        )
    }

    #[test]
    fn plan_always_has_at_least_one_step() {
        assert_eq!(derive_execution_plan(&[]), vec![Button::Wait]);
    }

    #[test]
    fn plan_gates_later_steps_at_threshold() {
        let mut s1 = ButtonScores::default();
        s1.a = 0.9;
        let mut s2 = ButtonScores::default();
        s2.up = 0.86;
        let mut s3 = ButtonScores::default();
        s3.up = 0.84;
        let mut s4 = ButtonScores::default();
        s4.up = 0.99;
        // s3 falls below the threshold and terminates the plan before s4.
        let plan = derive_execution_plan(&[s1, s2, s3, s4]);
        assert_eq!(plan, vec![Button::A, Button::Up]);
    }

    #[test]
    fn plan_first_step_is_unconditional() {
        let mut s1 = ButtonScores::default();
        s1.b = 0.3;
        assert_eq!(derive_execution_plan(&[s1]), vec![Button::B]);
    }

    #[tokio::test]
    async fn two_phase_decide_merges_state_and_counts_usage() {
        let model = Arc::new(FakeModel::default());
        model.push_text(r#"{"screenType":"overworld","briefDescription":"a town"}"#);
        model.push_text(&decision_json("A", 0.9));
        let step = DecisionStep::new(model.clone());

        let outcome = step.decide(base_inputs(), Utc::now()).await;
        assert!(!outcome.decision.is_fallback);
        assert_eq!(outcome.decision.button, Button::A);
        assert_eq!(outcome.decision.confidence, 0.9);
        assert_eq!(outcome.game_state.area, "pallet-town");
        assert_eq!(outcome.game_state.screen_type, ScreenKind::Overworld);
        assert_eq!(outcome.game_state.last_input, Some(Button::A));
        assert!(outcome.usage.prompt_tokens > 0);
        assert!(outcome.cost > 0.0);
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn screen_hint_skips_first_phase() {
        let model = Arc::new(FakeModel::default());
        model.push_text(&decision_json("UP", 0.8));
        let step = DecisionStep::new(model.clone());

        let mut inputs = base_inputs();
        inputs.screen_hint = Some(ScreenTypeReply {
            screen_type: ScreenKind::Battle,
            brief_description: "a battle".to_string(),
        });
        let outcome = step.decide(inputs, Utc::now()).await;
        assert_eq!(model.request_count(), 1);
        assert_eq!(outcome.screen.screen_type, ScreenKind::Battle);
    }

    #[tokio::test]
    async fn invalid_reply_falls_back_to_wait_with_estimated_usage() {
        let model = Arc::new(FakeModel::default());
        model.push_text(r#"{"screenType":"menu"}"#);
        model.push_text("press A, trust me");
        let step = DecisionStep::new(model);

        let outcome = step.decide(base_inputs(), Utc::now()).await;
        assert!(outcome.decision.is_fallback);
        assert_eq!(outcome.decision.button, Button::Wait);
        assert_eq!(outcome.decision.execution_plan, vec![Button::Wait]);
        assert!(outcome.usage.prompt_tokens >= FALLBACK_PROMPT_TOKENS);
        assert!(outcome.usage.completion_tokens >= FALLBACK_COMPLETION_TOKENS);
        assert!(outcome.cost > 0.0);
        // The screen phase result still lands in the merged state.
        assert_eq!(outcome.game_state.screen_type, ScreenKind::Menu);
    }

    #[tokio::test]
    async fn empty_sequence_falls_back() {
        let model = Arc::new(FakeModel::default());
        model.push_text(r#"{"screenType":"overworld"}"#);
        model.push_text(r#"{"decision":{"buttonSequence":[],"reasoning":"?"}}"#);
        let step = DecisionStep::new(model);
        let outcome = step.decide(base_inputs(), Utc::now()).await;
        assert!(outcome.decision.is_fallback);
    }

    #[tokio::test]
    async fn model_error_falls_back() {
        let model = Arc::new(FakeModel::default());
        model.push_text(r#"{"screenType":"overworld"}"#);
        model.push_error("boom");
        let step = DecisionStep::new(model);
        let outcome = step.decide(base_inputs(), Utc::now()).await;
        assert!(outcome.decision.is_fallback);
        assert_eq!(outcome.decision.button, Button::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn decision_phase_timeout_falls_back() {
        let model = Arc::new(FakeModel::default());
        model.push_text(r#"{"screenType":"overworld"}"#);
        model.stall_next();
        let step = DecisionStep::new(model);
        let outcome = step.decide(base_inputs(), Utc::now()).await;
        assert!(outcome.decision.is_fallback);
        assert!(outcome.decision.reasoning.contains("timeout"));
    }

    #[test]
    fn merge_prefers_model_screen_type_over_phase_one() {
        let prev = GameState::default();
        let delta = GameStateDelta {
            screen_type: Some(ScreenKind::Dialogue),
            ..GameStateDelta::default()
        };
        let screen = ScreenTypeReply {
            screen_type: ScreenKind::Overworld,
            brief_description: String::new(),
        };
        let merged = merge_game_state(&prev, &delta, &screen, Button::A);
        assert_eq!(merged.screen_type, ScreenKind::Dialogue);
    }

    #[test]
    fn merge_tracks_visited_areas() {
        let prev = GameState::default();
        let delta = GameStateDelta {
            area: Some("route-1".to_string()),
            ..GameStateDelta::default()
        };
        let merged = merge_game_state(&prev, &delta, &ScreenTypeReply::default(), Button::Up);
        assert_eq!(merged.progress.visited_areas, vec!["route-1"]);
        let merged2 = merge_game_state(&merged, &delta, &ScreenTypeReply::default(), Button::Up);
        assert_eq!(merged2.progress.unique_area_count, 1);
    }

    #[test]
    fn merge_interprets_party_hp_fraction_and_percent() {
        let delta = GameStateDelta {
            estimated_party_hp: Some(0.5),
            ..GameStateDelta::default()
        };
        let merged = merge_game_state(
            &GameState::default(),
            &delta,
            &ScreenTypeReply::default(),
            Button::A,
        );
        assert_eq!(merged.party_hp.current, 50);
        let delta = GameStateDelta {
            estimated_party_hp: Some(75.0),
            ..GameStateDelta::default()
        };
        let merged = merge_game_state(
            &GameState::default(),
            &delta,
            &ScreenTypeReply::default(),
            Button::A,
        );
        assert_eq!(merged.party_hp.current, 75);
    }

    #[test]
    fn normalize_enforces_history_bounds() {
        let mut inputs = base_inputs();
        inputs.previous_frames = (0..5).map(|i| format!("frame-{i}")).collect();
        inputs.dialog_history = (0..15).map(|i| format!("say-{i}")).collect();
        let inputs = inputs.normalize();
        assert_eq!(inputs.previous_frames, vec!["frame-3", "frame-4"]);
        assert_eq!(inputs.dialog_history.len(), DIALOG_HISTORY_LIMIT);
        assert_eq!(inputs.dialog_history[0], "say-5");
    }
}
