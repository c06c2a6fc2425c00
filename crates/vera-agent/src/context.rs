//! Prompt assembly: system prompt, epistemic banner, pinned task and notes,
//! open-condition sections, then a history tail trimmed oldest-first to the
//! character budget.

use crate::llm::ChatMessage;
use vera_core::epistemic::EpistemicState;

pub fn total_chars(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.chars().count()).sum()
}

fn bullet_section(title: &str, items: &[String]) -> Option<ChatMessage> {
    let body: Vec<String> = items
        .iter()
        .filter(|i| !i.is_empty())
        .map(|i| format!("- {i}"))
        .collect();
    if body.is_empty() {
        return None;
    }
    Some(ChatMessage::user(format!("{title}:\n{}", body.join("\n"))))
}

pub fn build_context(
    system_prompt: &str,
    system_role: &str,
    task: &str,
    history_tail: &[ChatMessage],
    notes_content: &str,
    epistemic: &EpistemicState,
    max_chars: usize,
) -> Vec<ChatMessage> {
    let mut msgs: Vec<ChatMessage> = Vec::new();
    if system_role.trim().eq_ignore_ascii_case("user") {
        msgs.push(ChatMessage::user(system_prompt));
    } else {
        msgs.push(ChatMessage::system(system_prompt));
    }
    msgs.push(ChatMessage::system(format!("EPISTEMIC STATE: {}", epistemic.status)));
    msgs.push(ChatMessage::user(format!("PRIMARY TASK:\n{task}")));

    if notes_content.trim().is_empty() {
        msgs.push(ChatMessage::system(
            "SYSTEM WARNING: notes.md is empty. Initialize /work/notes.md now before proceeding.",
        ));
        msgs.push(ChatMessage::user("CURRENT NOTES (PINNED):\n<empty>"));
    } else {
        msgs.push(ChatMessage::user(format!("CURRENT NOTES (PINNED):\n{notes_content}")));
    }

    if let Some(m) = bullet_section("OPEN CONSTRAINTS", &epistemic.constraints) {
        msgs.push(m);
    }
    if let Some(m) = bullet_section("UNRESOLVED REASONS", &epistemic.unresolved) {
        msgs.push(m);
    }
    if let Some(m) = bullet_section("BLOCKERS", &epistemic.blocked) {
        msgs.push(m);
    }

    // Trim the oldest history until the assembly fits the budget.
    let mut action_layer: Vec<ChatMessage> = history_tail.to_vec();
    loop {
        let mut assembled = msgs.clone();
        assembled.extend(action_layer.iter().cloned());
        if total_chars(&assembled) <= max_chars || action_layer.is_empty() {
            return assembled;
        }
        action_layer.remove(0);
    }
}
