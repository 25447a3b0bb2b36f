//! Prompt cache breakpoint placement for LLM requests.
//!
//! Providers like Anthropic charge less for input tokens re-sent with a
//! cache-control marker, but only above a minimum token count and only at
//! marker boundaries the caller chooses. This module decides where those
//! markers go; it tracks no state and makes no claim about whether the
//! provider actually served a cached prefix.

use super::types::ChatMessage;

/// Determine optimal cache breakpoints in a message sequence.
///
/// Anthropic caching requires minimum 1024 tokens for cache-eligible content.
/// This function identifies where to place cache control markers.
pub fn find_cache_breakpoints(
    system: Option<&str>,
    messages: &[ChatMessage],
    min_tokens: usize,
) -> Vec<usize> {
    let mut breakpoints = Vec::new();
    let mut cumulative_chars = 0;

    // Approximate tokens as chars / 4
    let chars_threshold = min_tokens * 4;

    // Check system prompt
    if let Some(s) = system {
        cumulative_chars += s.len();
        if cumulative_chars >= chars_threshold {
            // System prompt itself is cache-eligible
            breakpoints.push(0); // Special marker for system
        }
    }

    // Check messages
    for (i, msg) in messages.iter().enumerate() {
        cumulative_chars += msg.content.len();
        if cumulative_chars >= chars_threshold && !breakpoints.contains(&(i + 1)) {
            breakpoints.push(i + 1);
        }
    }

    breakpoints
}

/// Apply cache control markers to messages.
pub fn apply_cache_markers(messages: &mut [ChatMessage], breakpoints: &[usize]) {
    for &bp in breakpoints {
        if bp > 0 && bp <= messages.len() {
            messages[bp - 1].cache_control = Some(super::types::CacheControl::Ephemeral);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_cache_breakpoints() {
        let messages = vec![
            ChatMessage::user("Short message"),
            ChatMessage::assistant("Another short one"),
            ChatMessage::user("A".repeat(5000)), // Long message
        ];

        // With 1024 token minimum (~4096 chars)
        let breakpoints = find_cache_breakpoints(None, &messages, 1024);

        // Should find a breakpoint after the long message
        assert!(!breakpoints.is_empty());
    }

    #[test]
    fn test_find_cache_breakpoints_marks_system_prompt_when_large() {
        let system = "A".repeat(5000);
        let messages = vec![ChatMessage::user("short")];

        let breakpoints = find_cache_breakpoints(Some(&system), &messages, 1024);

        assert!(breakpoints.contains(&0));
    }

    #[test]
    fn test_apply_cache_markers() {
        let mut messages = vec![
            ChatMessage::user("Message 1"),
            ChatMessage::assistant("Message 2"),
            ChatMessage::user("Message 3"),
        ];

        let breakpoints = vec![2]; // After message 2
        apply_cache_markers(&mut messages, &breakpoints);

        assert!(messages[0].cache_control.is_none());
        assert!(messages[1].cache_control.is_some());
        assert!(messages[2].cache_control.is_none());
    }
}
