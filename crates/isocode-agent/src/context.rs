//! Context window management: token accounting, trim-to-budget, and
//! LLM-assisted compaction.

use isocode_core::{smart_truncate, Message, Role};
use isocode_llm::{CallOptions, ChatMessage, LlmProvider};
use tracing::{debug, info};

const CHARS_PER_TOKEN: f32 = 3.5;
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Compaction never rewrites the last four messages.
const COMPACTION_TAIL: usize = 4;
/// Minimum leftover budget (in characters) for a partial oldest message.
const MIN_PARTIAL_CHARS: usize = 200;

pub struct ContextManager;

impl ContextManager {
    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &Message) -> usize {
        Self::estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
    }

    pub fn conversation_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Self::message_tokens).sum()
    }

    /// A view of the conversation trimmed to the token budget.
    ///
    /// The system message always survives. Remaining messages are taken
    /// newest-first; the oldest that only partially fits is included as a
    /// smart-truncated prefix when at least 200 characters of budget remain.
    /// An oversized system prompt is itself truncated and paired with only
    /// the most recent message.
    pub fn trim_for_context_window(messages: &[Message], budget: usize) -> Vec<Message> {
        let Some((first, rest)) = messages.split_first() else {
            return Vec::new();
        };
        if first.role != Role::System {
            // No system prompt; treat everything uniformly.
            return Self::trim_tail(messages, budget);
        }

        let system_tokens = Self::message_tokens(first);
        if system_tokens > budget {
            let budget_chars = (budget as f32 * CHARS_PER_TOKEN) as usize;
            let mut out = vec![Message::system(smart_truncate(&first.content, budget_chars))];
            if let Some(last) = rest.last() {
                out.push(last.clone());
            }
            return out;
        }

        let mut out = Self::trim_tail(rest, budget - system_tokens);
        out.insert(0, first.clone());
        out
    }

    fn trim_tail(messages: &[Message], budget: usize) -> Vec<Message> {
        let mut kept: Vec<Message> = Vec::new();
        let mut used = 0usize;

        for message in messages.iter().rev() {
            let tokens = Self::message_tokens(message);
            if used + tokens <= budget {
                used += tokens;
                kept.push(message.clone());
                continue;
            }
            // Partial inclusion of the oldest message that does not fit.
            let remaining_tokens = budget.saturating_sub(used + MESSAGE_OVERHEAD_TOKENS);
            let remaining_chars = (remaining_tokens as f32 * CHARS_PER_TOKEN) as usize;
            if remaining_chars >= MIN_PARTIAL_CHARS {
                let mut partial = message.clone();
                partial.content = smart_truncate(&partial.content, remaining_chars);
                kept.push(partial);
            }
            break;
        }

        kept.reverse();
        kept
    }

    /// Summarise everything except the last four messages into one
    /// observation-shaped assistant message. The provider failure path falls
    /// back to a deterministic digest of the user messages.
    ///
    /// Errors only when there is no prefix worth compacting.
    pub async fn compact(
        provider: &dyn LlmProvider,
        model: &str,
        messages: &[Message],
    ) -> Result<Vec<Message>, String> {
        let has_system = messages.first().map(|m| m.role == Role::System).unwrap_or(false);
        let head = usize::from(has_system);
        if messages.len() <= head + COMPACTION_TAIL + 1 {
            return Err("nothing to compact".to_string());
        }
        let split = messages.len() - COMPACTION_TAIL;
        let prefix = &messages[head..split];

        let summary = match Self::llm_summary(provider, model, prefix).await {
            Ok(s) => s,
            Err(e) => {
                debug!("compaction summary failed ({}), using fallback", e);
                Self::fallback_summary(prefix)
            }
        };

        let replacement = serde_json::json!({
            "type": "observation",
            "content": format!("[summary of {} messages] {}", prefix.len(), summary),
        });

        let mut out = Vec::with_capacity(head + 1 + COMPACTION_TAIL);
        out.extend(messages[..head].iter().cloned());
        out.push(Message::assistant(replacement.to_string()));
        out.extend(messages[split..].iter().cloned());

        info!(
            "compacted conversation: {} -> {} messages",
            messages.len(),
            out.len()
        );
        Ok(out)
    }

    /// End-of-session summary for the cross-session memory file. Falls back
    /// to the deterministic digest; `None` when there is nothing to say.
    pub async fn session_summary(
        provider: &dyn LlmProvider,
        model: &str,
        messages: &[Message],
    ) -> Option<String> {
        let body: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if body.is_empty() {
            return None;
        }
        match Self::llm_summary(provider, model, &body).await {
            Ok(summary) => Some(summary),
            Err(_) => {
                let fallback = Self::fallback_summary(&body);
                (!fallback.is_empty()).then_some(fallback)
            }
        }
    }

    async fn llm_summary(
        provider: &dyn LlmProvider,
        model: &str,
        prefix: &[Message],
    ) -> Result<String, String> {
        let mut transcript = String::new();
        for message in prefix {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            transcript.push_str(&format!(
                "{}: {}\n",
                role,
                smart_truncate(&message.content, 600)
            ));
        }

        let instruction = format!(
            "Summarise this agent conversation in 2-4 bullets covering: what \
             was asked, what tools were used, what changes were made, and \
             what the current state is. Reply with the bullets only.\n\n{}",
            transcript
        );

        let options = CallOptions {
            max_tokens: Some(512),
            temperature: Some(0.2),
            timeout: std::time::Duration::from_secs(60),
            ..Default::default()
        };
        let reply = provider
            .call(model, &[ChatMessage::new("user", instruction)], &options)
            .await
            .map_err(|e| e.to_string())?;
        if reply.content.trim().is_empty() {
            return Err("empty summary".to_string());
        }
        Ok(reply.content.trim().to_string())
    }

    fn fallback_summary(prefix: &[Message]) -> String {
        prefix
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.chars().take(100).collect::<String>())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimation_uses_char_ratio() {
        assert_eq!(ContextManager::estimate_tokens(""), 0);
        assert_eq!(ContextManager::estimate_tokens("hello"), 2); // 5/3.5 -> 2
        assert_eq!(ContextManager::estimate_tokens("hello world"), 4); // 11/3.5 -> 4
    }

    #[test]
    fn message_tokens_include_overhead() {
        let m = Message::user("hello");
        assert_eq!(ContextManager::message_tokens(&m), 6);
    }

    #[test]
    fn trim_keeps_system_and_newest() {
        let mut messages = vec![Message::system("be helpful")];
        for i in 0..50 {
            messages.push(Message::user(format!("message number {} {}", i, "pad ".repeat(50))));
        }
        let trimmed = ContextManager::trim_for_context_window(&messages, 500);
        assert_eq!(trimmed[0].role, Role::System);
        assert!(trimmed.len() < messages.len());
        // newest message survives verbatim
        assert_eq!(
            trimmed.last().unwrap().content,
            messages.last().unwrap().content
        );
        assert!(ContextManager::conversation_tokens(&trimmed) <= 500);
    }

    #[test]
    fn trim_oversized_system_prompt() {
        let messages = vec![
            Message::system("x".repeat(10_000)),
            Message::user("first"),
            Message::user("latest"),
        ];
        let trimmed = ContextManager::trim_for_context_window(&messages, 100);
        assert_eq!(trimmed.len(), 2);
        assert!(trimmed[0].content.contains("characters omitted"));
        assert_eq!(trimmed[1].content, "latest");
    }

    #[test]
    fn trim_within_budget_is_identity() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let trimmed = ContextManager::trim_for_context_window(&messages, 10_000);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].content, "hi");
    }
}
