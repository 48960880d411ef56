//! Conversation history persistence and prompt hydration.
//!
//! `store` owns the libsql-backed `ConversationStore`; the helpers here turn
//! a window of stored `Message` rows into the transcript prefix the planner
//! feeds to the model.

pub mod store;

use crate::types::Message;

/// Rough token estimate for a piece of text (~4 characters per token for
/// English). Used only to bound how much history gets hydrated into a
/// prompt; not a substitute for the model provider's own tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Trims `history` to the most recent messages that fit within `token_budget`,
/// working backwards from the newest message and restoring chronological
/// order before returning.
pub fn truncate_history_to_tokens(history: &[Message], token_budget: usize) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::new();
    let mut total_tokens = 0;

    for msg in history.iter().rev() {
        let msg_tokens = estimate_tokens(&msg.content);
        if total_tokens + msg_tokens > token_budget {
            break;
        }
        result.push(msg.clone());
        total_tokens += msg_tokens;
    }

    result.reverse();
    result
}

/// Formats a window of prior messages into a transcript fragment suitable
/// for prepending to a prompt, e.g. for providers that want history folded
/// into a single text block rather than as structured messages.
pub fn format_history_for_prompt(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;
    use chrono::Utc;

    fn message(content: &str) -> Message {
        Message {
            id: None,
            session_id: "s".into(),
            user_key: "u".into(),
            role: MessageRole::User,
            content: content.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn estimate_tokens_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("this is a longer test string"), 8);
    }

    #[test]
    fn truncate_history_to_tokens_keeps_most_recent() {
        let history = vec![message("a"), message("b"), message(&"c".repeat(400))];
        let truncated = truncate_history_to_tokens(&history, 10);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].content, "a");
        assert_eq!(truncated[1].content, "b");
    }

    #[test]
    fn format_history_for_prompt_includes_roles() {
        let history = vec![message("hello")];
        let formatted = format_history_for_prompt(&history);
        assert_eq!(formatted, "user: hello");
    }
}
