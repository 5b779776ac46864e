use serde::{Deserialize, Serialize};

use crate::api::{ChatToolCall, ChatToolCallFunction, ToolCallDelta};

/// The in-progress, merged representation of one streamed tool call.
/// `text_offset` records how much text content had accumulated when the call
/// was first observed; it anchors rendering order and never changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallAccumulator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
    pub text_offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCallAccumulator {
    /// Finalized form for outgoing history. Calls that never received an id
    /// get a deterministic one derived from their index.
    pub fn to_chat_tool_call(&self) -> ChatToolCall {
        ChatToolCall {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("tool-call-{}", self.index)),
            kind: self.kind.clone(),
            function: ChatToolCallFunction {
                name: self.function.name.clone(),
                arguments: self.function.arguments.trim().to_string(),
            },
        }
    }
}

/// Fold one tool-call fragment into an accumulator list, returning the new
/// list. Pure: the same function runs for the primary message and for every
/// comparison target's accumulators.
///
/// Fragments resolve to an owner by id first, then by index, and otherwise
/// append a new accumulator. Argument fragments assume the transport either
/// appends or resends from the start; overlapping partial resends are not
/// detected.
pub fn merge_tool_call_delta(
    existing: &[ToolCallAccumulator],
    delta: &ToolCallDelta,
    current_text_len: usize,
) -> Vec<ToolCallAccumulator> {
    let mut merged = existing.to_vec();

    let position = delta
        .id
        .as_deref()
        .and_then(|id| merged.iter().position(|acc| acc.id.as_deref() == Some(id)))
        .or_else(|| {
            delta
                .index
                .and_then(|index| merged.iter().position(|acc| acc.index == index))
        });

    match position {
        Some(position) => {
            let accumulator = &mut merged[position];
            if delta.id.is_some() {
                accumulator.id = delta.id.clone();
            }
            if let Some(kind) = &delta.kind {
                accumulator.kind = kind.clone();
            }
            if let Some(index) = delta.index {
                accumulator.index = index;
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    accumulator.function.name = name.clone();
                }
                if let Some(arguments) = &function.arguments {
                    accumulator.function.arguments =
                        merge_arguments(&accumulator.function.arguments, arguments);
                }
            }
        }
        None => {
            let next_index = merged.iter().map(|acc| acc.index + 1).max().unwrap_or(0);
            let function = delta.function.clone().unwrap_or_default();
            merged.push(ToolCallAccumulator {
                id: delta.id.clone(),
                index: delta.index.unwrap_or(next_index),
                kind: delta.kind.clone().unwrap_or_else(|| "function".to_string()),
                function: ToolCallFunction {
                    name: function.name.unwrap_or_default(),
                    arguments: function.arguments.unwrap_or_default(),
                },
                text_offset: current_text_len,
            });
        }
    }

    merged
}

/// Duplicate deliveries resend the argument string from the start; in that
/// case the longer resend wins. Everything else is a plain append.
fn merge_arguments(old: &str, new: &str) -> String {
    if !old.is_empty() && !new.is_empty() && new.starts_with(old) {
        new.to_string()
    } else {
        format!("{old}{new}")
    }
}
