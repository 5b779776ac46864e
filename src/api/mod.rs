use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::content::Content;

/// One entry in the outgoing message list. Primary targets see the full
/// conversation verbatim; comparison targets see a substituted view built by
/// the history module.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub id: String,
    pub role: String,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_outputs: Vec<ToolOutput>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<OutgoingMessage>,
    pub model: String,
    pub provider_id: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<String>,
    pub tools_enabled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub request_id: String,
}

/// Out-of-band interrupt for server-side generation. Best-effort; local
/// cancellation is authoritative for the client.
#[derive(Serialize, Clone, Debug)]
pub struct StopRequest {
    pub request_id: String,
}

/// A fragment of a streamed tool call. Any field may be absent; fragments
/// are folded into accumulators by the tool-call reducer.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<ToolCallFunctionDelta>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct ToolCallFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// A finalized tool call as sent back to the backend in history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatToolCallFunction {
    pub name: String,
    pub arguments: String,
}

/// The result of a tool execution, delivered on the stream by the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub name: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct UsageStats {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationMeta {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// The closed set of events a single request's stream can deliver. Each SSE
/// data payload is one of these, tagged by `type` with the payload under
/// `value`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StreamEvent {
    Text(String),
    ToolCall(ToolCallDelta),
    ToolOutput(ToolOutput),
    Usage(UsageStats),
    Conversation(ConversationMeta),
    Final(Content),
}

/// The single-shot response body returned when streaming is disabled. The
/// transport replays it as synthetic stream events so the engine folds both
/// transports identically.
#[derive(Deserialize, Clone, Debug)]
pub struct ChatResponseBody {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default)]
    pub tool_outputs: Vec<ToolOutput>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
    #[serde(default)]
    pub conversation: Option<ConversationMeta>,
}

pub mod models;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_events_deserialize_by_tag() {
        let text: StreamEvent = serde_json::from_str(r#"{"type":"text","value":"Hi"}"#)
            .expect("text event should parse");
        assert_eq!(text, StreamEvent::Text("Hi".to_string()));

        let usage: StreamEvent =
            serde_json::from_str(r#"{"type":"usage","value":{"completion_tokens":12}}"#)
                .expect("usage event should parse");
        match usage {
            StreamEvent::Usage(stats) => assert_eq!(stats.completion_tokens, Some(12)),
            other => panic!("expected usage event, got {:?}", other),
        }
    }

    #[test]
    fn tool_call_delta_tolerates_partial_fragments() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"tool_call","value":{"index":0,"function":{"arguments":"{\"q\":"}}}"#,
        )
        .expect("partial tool call should parse");
        match event {
            StreamEvent::ToolCall(delta) => {
                assert_eq!(delta.index, Some(0));
                assert!(delta.id.is_none());
                let function = delta.function.expect("function fragment");
                assert!(function.name.is_none());
                assert_eq!(function.arguments.as_deref(), Some("{\"q\":"));
            }
            other => panic!("expected tool call event, got {:?}", other),
        }
    }

    #[test]
    fn final_event_carries_content() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"final","value":"All done."}"#).expect("final parses");
        match event {
            StreamEvent::Final(content) => assert_eq!(content.flatten_text(), "All done."),
            other => panic!("expected final event, got {:?}", other),
        }
    }

    #[test]
    fn chat_request_omits_absent_optionals() {
        let request = ChatRequest {
            messages: Vec::new(),
            model: "alpha".to_string(),
            provider_id: "p".to_string(),
            stream: true,
            conversation_id: None,
            parent_conversation_id: None,
            tools_enabled: false,
            tools: Vec::new(),
            reasoning_effort: None,
            system_prompt: None,
            request_id: "req-1".to_string(),
        };
        let json = serde_json::to_value(&request).expect("request serializes");
        assert!(json.get("conversation_id").is_none());
        assert!(json.get("tools").is_none());
        assert!(json.get("system_prompt").is_none());
    }
}
