use crate::api::{ChatRequest, OutgoingMessage, ToolCallDelta, ToolOutput, UsageStats};
use crate::core::content::Content;
use crate::core::message::{ComparisonResult, ComparisonStatus, Message};
use crate::core::tool_calls::merge_tool_call_delta;
use crate::core::turn::TargetId;

/// Immutable per-dispatch context, captured when the request is built. A
/// request never reads live engine settings after dispatch; anything it
/// needs travels in this snapshot.
#[derive(Clone, Debug)]
pub struct DispatchSnapshot {
    pub provider_id: String,
    pub model: String,
    pub stream: bool,
    pub conversation_id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub tools_enabled: bool,
    pub tools: Vec<String>,
    pub reasoning_effort: Option<String>,
    pub system_prompt: Option<String>,
}

pub fn build_request(
    snapshot: DispatchSnapshot,
    messages: Vec<OutgoingMessage>,
    request_id: String,
) -> ChatRequest {
    ChatRequest {
        messages,
        model: snapshot.model,
        provider_id: snapshot.provider_id,
        stream: snapshot.stream,
        conversation_id: snapshot.conversation_id,
        parent_conversation_id: snapshot.parent_conversation_id,
        tools_enabled: snapshot.tools_enabled,
        tools: snapshot.tools,
        reasoning_effort: snapshot.reasoning_effort,
        system_prompt: snapshot.system_prompt,
        request_id,
    }
}

/// The mutable state a stream update lands in: the primary assistant message
/// itself, or one model's comparison slot on it.
pub enum TargetSlot<'a> {
    Primary(&'a mut Message),
    Comparison(&'a mut ComparisonResult),
}

/// Locate the slot for `(assistant message id, target)`, enforcing the
/// staleness rules: the owning message must still be the last one, and a
/// comparison target must still be registered on it. Anything else resolves
/// to `None` and the update becomes a no-op.
pub fn resolve_slot<'a>(
    messages: &'a mut [Message],
    assistant_message_id: &str,
    target: &TargetId,
) -> Option<TargetSlot<'a>> {
    let last = messages.last_mut()?;
    if !last.is_assistant() || last.id != assistant_message_id {
        return None;
    }

    match target {
        TargetId::Primary => Some(TargetSlot::Primary(last)),
        TargetId::Comparison(key) => last
            .comparison_results
            .get_mut(key)
            .map(TargetSlot::Comparison),
    }
}

impl TargetSlot<'_> {
    pub fn append_text(&mut self, chunk: &str) {
        match self {
            TargetSlot::Primary(message) => message.content.push_text(chunk),
            TargetSlot::Comparison(result) => result.content.push_text(chunk),
        }
    }

    pub fn apply_tool_call(&mut self, delta: &ToolCallDelta) {
        match self {
            TargetSlot::Primary(message) => {
                message.tool_calls =
                    merge_tool_call_delta(&message.tool_calls, delta, message.content.text_len());
            }
            TargetSlot::Comparison(result) => {
                result.tool_calls =
                    merge_tool_call_delta(&result.tool_calls, delta, result.content.text_len());
            }
        }
    }

    /// Record a tool output, deduplicated by `tool_call_id` when present,
    /// falling back to the tool name. A re-delivery replaces the entry.
    pub fn apply_tool_output(&mut self, output: ToolOutput) {
        let outputs = match self {
            TargetSlot::Primary(message) => &mut message.tool_outputs,
            TargetSlot::Comparison(result) => &mut result.tool_outputs,
        };

        let position = match &output.tool_call_id {
            Some(id) => outputs
                .iter()
                .position(|existing| existing.tool_call_id.as_deref() == Some(id)),
            None => outputs
                .iter()
                .position(|existing| existing.tool_call_id.is_none() && existing.name == output.name),
        };

        match position {
            Some(position) => outputs[position] = output,
            None => outputs.push(output),
        }
    }

    pub fn apply_usage(&mut self, usage: UsageStats) {
        match self {
            TargetSlot::Primary(message) => message.usage = Some(usage),
            TargetSlot::Comparison(result) => result.usage = Some(usage),
        }
    }

    /// Terminal success: the authoritative final content wins when non-empty,
    /// otherwise whatever streamed stands. Comparison slots flip to complete.
    pub fn finalize(&mut self, content: Content) {
        match self {
            TargetSlot::Primary(message) => {
                if !content.is_empty() {
                    message.content = content;
                }
            }
            TargetSlot::Comparison(result) => {
                if !content.is_empty() {
                    result.content = content;
                }
                result.status = ComparisonStatus::Complete;
                result.error = None;
            }
        }
    }

    /// Terminal failure for a comparison slot; the rest of the turn is
    /// untouched.
    pub fn mark_error(&mut self, message: String) {
        if let TargetSlot::Comparison(result) = self {
            result.status = ComparisonStatus::Error;
            result.error = Some(message);
        }
    }

    /// Cancellation: keep partial content as-is, but leave no slot dangling
    /// in `streaming` after the turn settles.
    pub fn mark_stopped(&mut self) {
        if let TargetSlot::Comparison(result) = self {
            if result.status == ComparisonStatus::Streaming {
                result.status = ComparisonStatus::Complete;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_with_id(id: &str) -> Message {
        let mut message = Message::assistant_placeholder();
        message.id = id.to_string();
        message
    }

    #[test]
    fn slot_resolution_requires_last_assistant_match() {
        let mut messages = vec![
            Message::user(Content::text("hi")),
            assistant_with_id("assistant-1"),
        ];

        assert!(resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).is_some());
        assert!(resolve_slot(&mut messages, "assistant-0", &TargetId::Primary).is_none());

        // A newer message supersedes the turn's assistant message.
        messages.push(Message::user(Content::text("next")));
        assert!(resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).is_none());
    }

    #[test]
    fn unregistered_comparison_target_does_not_resolve() {
        let mut message = assistant_with_id("assistant-1");
        message
            .comparison_results
            .insert("p::known".to_string(), ComparisonResult::streaming());
        let mut messages = vec![message];

        assert!(resolve_slot(
            &mut messages,
            "assistant-1",
            &TargetId::Comparison("p::known".to_string())
        )
        .is_some());
        assert!(resolve_slot(
            &mut messages,
            "assistant-1",
            &TargetId::Comparison("p::removed".to_string())
        )
        .is_none());
    }

    #[test]
    fn tool_outputs_dedup_by_id_then_name() {
        let mut messages = vec![assistant_with_id("assistant-1")];
        let mut slot =
            resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).expect("slot");

        slot.apply_tool_output(ToolOutput {
            tool_call_id: Some("call-1".to_string()),
            name: "search".to_string(),
            content: "partial".to_string(),
        });
        slot.apply_tool_output(ToolOutput {
            tool_call_id: Some("call-1".to_string()),
            name: "search".to_string(),
            content: "final".to_string(),
        });
        slot.apply_tool_output(ToolOutput {
            tool_call_id: None,
            name: "fetch".to_string(),
            content: "body".to_string(),
        });
        slot.apply_tool_output(ToolOutput {
            tool_call_id: None,
            name: "fetch".to_string(),
            content: "body v2".to_string(),
        });

        let outputs = &messages[0].tool_outputs;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].content, "final");
        assert_eq!(outputs[1].content, "body v2");
    }

    #[test]
    fn finalize_keeps_streamed_content_when_final_is_empty() {
        let mut message = assistant_with_id("assistant-1");
        message.content.push_text("streamed");
        let mut messages = vec![message];
        let mut slot =
            resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).expect("slot");

        slot.finalize(Content::default());
        assert_eq!(messages[0].content, Content::text("streamed"));

        let mut slot =
            resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).expect("slot");
        slot.finalize(Content::text("authoritative"));
        assert_eq!(messages[0].content, Content::text("authoritative"));
    }

    #[test]
    fn usage_replaces_wholesale() {
        let mut messages = vec![assistant_with_id("assistant-1")];
        let mut slot =
            resolve_slot(&mut messages, "assistant-1", &TargetId::Primary).expect("slot");
        slot.apply_usage(UsageStats {
            prompt_tokens: Some(10),
            completion_tokens: Some(2),
            total_tokens: Some(12),
        });
        slot.apply_usage(UsageStats {
            completion_tokens: Some(20),
            ..UsageStats::default()
        });

        let usage = messages[0].usage.as_ref().expect("usage");
        assert_eq!(usage.completion_tokens, Some(20));
        assert_eq!(usage.prompt_tokens, None);
    }
}
