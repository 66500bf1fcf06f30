//! Wire contract for model replies: the screen-type phase and the full
//! decision phase. Parsing is strict about shape and forgiving about
//! optional fields; anything that fails here maps to the fallback
//! decision upstream.

use serde::{Deserialize, Serialize};

use super::state::ScreenKind;
use crate::frame::Button;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    MissingJsonObject,
    InvalidJson(String),
    EmptySequence,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::MissingJsonObject => write!(f, "no json object in model reply"),
            SchemaError::InvalidJson(msg) => write!(f, "invalid model reply json: {msg}"),
            SchemaError::EmptySequence => write!(f, "buttonSequence must have at least one step"),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Per-button confidence table. Every field defaults to zero so partial
/// replies still deserialize.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct ButtonScores {
    #[serde(default, rename = "A")]
    pub a: f64,
    #[serde(default, rename = "B")]
    pub b: f64,
    #[serde(default, rename = "START")]
    pub start: f64,
    #[serde(default, rename = "SELECT")]
    pub select: f64,
    #[serde(default, rename = "UP")]
    pub up: f64,
    #[serde(default, rename = "DOWN")]
    pub down: f64,
    #[serde(default, rename = "LEFT")]
    pub left: f64,
    #[serde(default, rename = "RIGHT")]
    pub right: f64,
    #[serde(default, rename = "L")]
    pub l: f64,
    #[serde(default, rename = "R")]
    pub r: f64,
    #[serde(default, rename = "WAIT")]
    pub wait: f64,
}

impl ButtonScores {
    pub fn get(&self, button: Button) -> f64 {
        match button {
            Button::A => self.a,
            Button::B => self.b,
            Button::Start => self.start,
            Button::Select => self.select,
            Button::Up => self.up,
            Button::Down => self.down,
            Button::Left => self.left,
            Button::Right => self.right,
            Button::L => self.l,
            Button::R => self.r,
            Button::Wait => self.wait,
        }
    }

    pub fn set(&mut self, button: Button, score: f64) {
        let slot = match button {
            Button::A => &mut self.a,
            Button::B => &mut self.b,
            Button::Start => &mut self.start,
            Button::Select => &mut self.select,
            Button::Up => &mut self.up,
            Button::Down => &mut self.down,
            Button::Left => &mut self.left,
            Button::Right => &mut self.right,
            Button::L => &mut self.l,
            Button::R => &mut self.r,
            Button::Wait => &mut self.wait,
        };
        *slot = score;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Button, f64)> + '_ {
        crate::frame::ALL_BUTTONS.iter().map(|b| (*b, self.get(*b)))
    }

    /// Highest-confidence button. Ties resolve to the first button in
    /// vocabulary order so the result is deterministic.
    pub fn argmax(&self) -> (Button, f64) {
        let mut best = (Button::A, self.a);
        for (button, score) in self.iter() {
            if score > best.1 {
                best = (button, score);
            }
        }
        best
    }

    /// Clamps every score into [0, 1].
    pub fn clamped(mut self) -> Self {
        for button in crate::frame::ALL_BUTTONS {
            self.set(button, self.get(button).clamp(0.0, 1.0));
        }
        self
    }

    /// The canonical low-confidence table used by fallback decisions:
    /// everything flat except a mild preference for WAIT.
    pub fn fallback() -> Self {
        let mut scores = Self::default();
        for button in crate::frame::ALL_BUTTONS {
            scores.set(button, 0.05);
        }
        scores.wait = 0.5;
        scores
    }
}

/// Reply of the lightweight screen-type phase.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScreenTypeReply {
    #[serde(default)]
    pub screen_type: ScreenKind,
    #[serde(default)]
    pub brief_description: String,
}

/// `gameState` block of the decision reply. Every field optional; the
/// merger only overwrites what the model actually asserted.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameStateDelta {
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub in_battle: Option<bool>,
    #[serde(default)]
    pub in_menu: Option<bool>,
    #[serde(default)]
    pub in_dialogue: Option<bool>,
    #[serde(default)]
    pub in_text_entry: Option<bool>,
    #[serde(default)]
    pub pokemon_count: Option<u32>,
    #[serde(default)]
    pub badges: Option<u32>,
    #[serde(default)]
    pub screen_type: Option<ScreenKind>,
    #[serde(default, rename = "estimatedPartyHP")]
    pub estimated_party_hp: Option<f64>,
}

/// Structured notes delta written back by the model. All fields optional
/// and nullable; merge semantics live in the memory store.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotesDelta {
    #[serde(default)]
    pub current_objective: Option<String>,
    #[serde(default)]
    pub last_known_location: Option<String>,
    #[serde(default)]
    pub exit_found: Option<String>,
    #[serde(default)]
    pub stuck_mode: Option<String>,
    #[serde(default)]
    pub failed_attempts: Option<Vec<String>>,
    #[serde(default)]
    pub important_discovery: Option<String>,
    #[serde(default)]
    pub general: Option<String>,
}

impl NotesDelta {
    pub fn is_empty(&self) -> bool {
        self.current_objective.is_none()
            && self.last_known_location.is_none()
            && self.exit_found.is_none()
            && self.stuck_mode.is_none()
            && self.failed_attempts.as_ref().is_none_or(|v| v.is_empty())
            && self.important_discovery.is_none()
            && self.general.is_none()
    }
}

/// `decision` block of the decision reply.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    #[serde(default)]
    pub screen_analysis: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, rename = "personality_comment")]
    pub personality_comment: Option<String>,
    #[serde(default)]
    pub button_sequence: Vec<ButtonScores>,
    #[serde(default)]
    pub progress_confidence: f64,
    #[serde(default)]
    pub notes: Option<NotesDelta>,
}

/// Full decision-phase reply.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionReply {
    #[serde(default)]
    pub game_state: GameStateDelta,
    pub decision: DecisionBody,
}

/// Extracts the outermost `{...}` object from a reply that may carry
/// markdown fences or prose around the JSON.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn parse_screen_type_reply(raw: &str) -> Result<ScreenTypeReply, SchemaError> {
    let json = extract_json_object(raw).ok_or(SchemaError::MissingJsonObject)?;
    serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson(e.to_string()))
}

/// Parses and validates a decision reply. Confidences are clamped to
/// [0, 1]; an empty button sequence is a schema violation.
pub fn parse_decision_reply(raw: &str) -> Result<DecisionReply, SchemaError> {
    let json = extract_json_object(raw).ok_or(SchemaError::MissingJsonObject)?;
    let mut reply: DecisionReply =
        serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
    if reply.decision.button_sequence.is_empty() {
        return Err(SchemaError::EmptySequence);
    }
    reply.decision.button_sequence = reply
        .decision
        .button_sequence
        .into_iter()
        .map(ButtonScores::clamped)
        .collect();
    reply.decision.progress_confidence = reply.decision.progress_confidence.clamp(0.0, 1.0);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_vocabulary_order_on_ties() {
        let mut scores = ButtonScores::default();
        scores.a = 0.5;
        scores.b = 0.5;
        assert_eq!(scores.argmax(), (Button::A, 0.5));
    }

    #[test]
    fn parse_screen_type_with_fences() {
        let raw = "```json\n{\"screenType\":\"battle\",\"briefDescription\":\"wild encounter\"}\n```";
        let reply = parse_screen_type_reply(raw).unwrap();
        assert_eq!(reply.screen_type, ScreenKind::Battle);
        assert_eq!(reply.brief_description, "wild encounter");
    }

    #[test]
    fn parse_screen_type_unknown_field_defaults() {
        let reply = parse_screen_type_reply("{\"briefDescription\":\"?\"}").unwrap();
        assert_eq!(reply.screen_type, ScreenKind::Unknown);
    }

    #[test]
    fn parse_decision_reply_full() {
        let raw = r#"{
            "gameState": {"area": "viridian-forest", "inBattle": false, "badges": 1},
            "decision": {
                "screenAnalysis": "trees everywhere",
                "reasoning": "head north",
                "personality_comment": null,
                "buttonSequence": [{"UP": 0.92, "A": 0.1}, {"UP": 0.9}],
                "progressConfidence": 0.7,
                "notes": {"currentObjective": "exit the forest"}
            }
        }"#;
        let reply = parse_decision_reply(raw).unwrap();
        assert_eq!(reply.game_state.area.as_deref(), Some("viridian-forest"));
        assert_eq!(reply.decision.button_sequence.len(), 2);
        assert_eq!(
            reply.decision.button_sequence[0].argmax(),
            (Button::Up, 0.92)
        );
        assert_eq!(
            reply
                .decision
                .notes
                .as_ref()
                .unwrap()
                .current_objective
                .as_deref(),
            Some("exit the forest")
        );
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let raw = r#"{"decision": {"buttonSequence": [], "reasoning": "?"}}"#;
        assert_eq!(parse_decision_reply(raw), Err(SchemaError::EmptySequence));
    }

    #[test]
    fn out_of_range_confidences_are_clamped() {
        let raw = r#"{"decision": {"buttonSequence": [{"A": 1.7, "B": -0.4}], "progressConfidence": 2.0}}"#;
        let reply = parse_decision_reply(raw).unwrap();
        assert_eq!(reply.decision.button_sequence[0].a, 1.0);
        assert_eq!(reply.decision.button_sequence[0].b, 0.0);
        assert_eq!(reply.decision.progress_confidence, 1.0);
    }

    #[test]
    fn prose_without_json_is_an_error() {
        assert_eq!(
            parse_decision_reply("I think you should press A"),
            Err(SchemaError::MissingJsonObject)
        );
    }
}
