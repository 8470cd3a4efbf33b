//! Prompt assembly: persona text, a bounded window of recent turns and the
//! current message, ending with the cue the model continues from.

use crate::ChatTurn;

/// Number of most recent history turns included in a prompt.
pub const HISTORY_WINDOW: usize = 6;

/// The last [`HISTORY_WINDOW`] turns, oldest first.
pub fn recent_turns(history: &[ChatTurn]) -> &[ChatTurn] {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    &history[start..]
}

pub fn render_history(history: &[ChatTurn]) -> String {
    recent_turns(history)
        .iter()
        .map(|turn| format!("{}: {}", turn.role.to_uppercase(), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(persona: &str, history: &[ChatTurn], message: &str) -> String {
    let rendered = render_history(history);
    let context = if rendered.is_empty() {
        "(none)"
    } else {
        rendered.as_str()
    };
    format!(
        "{}\n\nRecent context:\n{}\n\nUSER: {}\nASSISTANT:",
        persona.trim_end(),
        context,
        message
    )
}
