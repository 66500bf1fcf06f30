//! Prompt assembly for the two model phases. Sections are stable and the
//! hint vocabulary is small so prompts stay cache-friendly.

use std::fmt::Write;

use super::decision::DecisionInputs;
use super::heuristics::{PriorityAction, StuckKind};
use super::schema::{ButtonScores, ScreenTypeReply};
use crate::frame::{Button, ALL_BUTTONS};

pub const SCREEN_TYPE_SYSTEM: &str = "You classify a hand-held game screen. \
Reply with one JSON object: {\"screenType\":\"overworld|battle|menu|dialogue|textEntry|transition|unknown\",\"briefDescription\":\"...\"}. \
Nothing else.";

pub const DECISION_SYSTEM: &str = "You are playing a hand-held game through an emulator. \
Each turn you see the current screen and recent context, and you answer with one JSON object:\n\
{\"gameState\":{\"area\":\"...\",\"inBattle\":false,\"inMenu\":false,\"inDialogue\":false,\"inTextEntry\":false,\"pokemonCount\":0,\"badges\":0,\"screenType\":\"overworld\",\"estimatedPartyHP\":1.0},\n\
 \"decision\":{\"screenAnalysis\":\"...\",\"reasoning\":\"...\",\"personality_comment\":null,\n\
  \"buttonSequence\":[{\"A\":0.0,\"B\":0.0,\"START\":0.0,\"SELECT\":0.0,\"UP\":0.0,\"DOWN\":0.0,\"LEFT\":0.0,\"RIGHT\":0.0,\"L\":0.0,\"R\":0.0,\"WAIT\":0.0}],\n\
  \"progressConfidence\":0.5,\n\
  \"notes\":{\"currentObjective\":null,\"lastKnownLocation\":null,\"exitFound\":null,\"stuckMode\":null,\"failedAttempts\":null,\"importantDiscovery\":null,\"general\":null}}}\n\
Every buttonSequence step is a full confidence table over all 11 buttons; the highest-scoring button of each step is what gets pressed. \
Use WAIT when no input is the right move. Only steps you are at least 85% sure of belong in the sequence.";

pub fn build_screen_type_prompt(brief_game_state: &str) -> String {
    let mut prompt = String::new();
    writeln!(prompt, "Classify the attached screen.").unwrap();
    if !brief_game_state.is_empty() {
        writeln!(prompt, "Known context: {brief_game_state}").unwrap();
    }
    prompt
}

fn button_list(buttons: &[Button]) -> String {
    buttons
        .iter()
        .map(|b| b.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_scores(prompt: &mut String, scores: &ButtonScores) {
    for button in ALL_BUTTONS {
        write!(prompt, "{}={:.2} ", button.name(), scores.get(button)).unwrap();
    }
    prompt.push('\n');
}

/// Assembles the decision-phase user prompt. The current frame and the
/// previous frames travel as image parts, not in this text.
pub fn build_decision_prompt(inputs: &DecisionInputs, screen: &ScreenTypeReply) -> String {
    let mut prompt = String::new();

    writeln!(prompt, "[SCREEN]").unwrap();
    writeln!(prompt, "type: {}", screen.screen_type.as_str()).unwrap();
    if !screen.brief_description.is_empty() {
        writeln!(prompt, "description: {}", screen.brief_description).unwrap();
    }

    writeln!(prompt, "\n[PRIORITY]").unwrap();
    writeln!(prompt, "{}", inputs.priority.prompt_hint()).unwrap();
    if let Some(stuck) = inputs.stuck {
        let hint = match stuck {
            StuckKind::WallCollision => {
                "Recent identical direction presses changed nothing. You are walking into a wall; pick a different direction."
            }
            StuckKind::DialogueLoop => {
                "Repeated A presses changed nothing. Stop mashing A; try B or a direction."
            }
            StuckKind::Unknown => "The screen has not changed for several actions. Try something different.",
        };
        writeln!(prompt, "{hint}").unwrap();
    }

    if !inputs.notes_projection.is_empty() {
        writeln!(prompt, "\n[NOTES]").unwrap();
        writeln!(prompt, "{}", inputs.notes_projection).unwrap();
    }

    writeln!(prompt, "\n[GAME_STATE]").unwrap();
    let state_json =
        serde_json::to_string(&inputs.game_state).unwrap_or_else(|_| "{}".to_string());
    writeln!(prompt, "{state_json}").unwrap();

    if !inputs.command_history.is_empty() {
        writeln!(prompt, "\n[RECENT_COMMANDS]").unwrap();
        for line in &inputs.command_history {
            writeln!(prompt, "- {line}").unwrap();
        }
    }

    if !inputs.recent_decisions.is_empty() {
        writeln!(prompt, "\n[RECENT_DECISIONS]").unwrap();
        for d in &inputs.recent_decisions {
            writeln!(prompt, "- {}: {}", d.button.name(), d.reasoning).unwrap();
        }
    }

    if let Some(scores) = &inputs.previous_scores {
        writeln!(prompt, "\n[PREVIOUS_SCORES]").unwrap();
        write_scores(&mut prompt, scores);
    }

    let mut hints: Vec<String> = Vec::new();
    if inputs.avoid_start_select {
        hints.push("Avoid START and SELECT; they were pressed repeatedly.".to_string());
    }
    if inputs.avoid_wait {
        hints.push("Avoid WAIT; too many consecutive waits.".to_string());
    }
    if inputs.avoid_b {
        hints.push("Avoid B; it has been pressed too often in a row.".to_string());
    }
    if !inputs.buttons_to_avoid.is_empty() {
        hints.push(format!(
            "These buttons produced no visual change recently: {}.",
            button_list(&inputs.buttons_to_avoid)
        ));
    }
    if !inputs.banned_buttons.is_empty() {
        hints.push(format!(
            "BANNED this turn (do not choose): {}.",
            button_list(&inputs.banned_buttons)
        ));
    }
    if !hints.is_empty() {
        writeln!(prompt, "\n[HINTS]").unwrap();
        for hint in hints {
            writeln!(prompt, "- {hint}").unwrap();
        }
    }

    if !inputs.dialog_history.is_empty() {
        writeln!(prompt, "\n[YOUR_RECENT_COMMENTS]").unwrap();
        for comment in &inputs.dialog_history {
            writeln!(prompt, "- {comment}").unwrap();
        }
    }

    writeln!(
        prompt,
        "\nAnswer with the single JSON object described in the system message."
    )
    .unwrap();

    prompt
}
