use crate::api::OutgoingMessage;
use crate::core::message::{Message, Role};

/// Build the outgoing message list for one target.
///
/// The primary target sees the conversation verbatim, tool-role messages
/// included. Comparison targets see their own prior output substituted for
/// each assistant message and never see tool-role messages or another
/// target's content; tool results reach them only as `tool_outputs` merged
/// onto the owning assistant entry.
pub fn build_history(
    source: &[Message],
    target_model: &str,
    is_primary: bool,
) -> Vec<OutgoingMessage> {
    if is_primary {
        return source.iter().map(outgoing_from_message).collect();
    }

    let mut history = Vec::with_capacity(source.len());
    for message in source {
        match message.role {
            Role::Assistant => {
                let Some(result) = message.comparison_results.get(target_model) else {
                    continue;
                };
                if result.is_empty_payload() {
                    continue;
                }
                history.push(OutgoingMessage {
                    id: result.message_id.clone().unwrap_or_else(|| message.id.clone()),
                    role: Role::Assistant.as_str().to_string(),
                    content: result.content.clone(),
                    tool_calls: result
                        .tool_calls
                        .iter()
                        .map(|acc| acc.to_chat_tool_call())
                        .collect(),
                    tool_outputs: result.tool_outputs.clone(),
                });
            }
            Role::Tool => {}
            _ => history.push(outgoing_from_message(message)),
        }
    }
    history
}

/// Append the turn's user message, replacing an entry with the same id in
/// place when the edit/regenerate path already rebuilt it into the history.
pub fn append_user_message(history: &mut Vec<OutgoingMessage>, user: OutgoingMessage) {
    match history.iter().position(|entry| entry.id == user.id) {
        Some(position) => history[position] = user,
        None => history.push(user),
    }
}

pub fn outgoing_from_message(message: &Message) -> OutgoingMessage {
    OutgoingMessage {
        id: message.id.clone(),
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|acc| acc.to_chat_tool_call())
            .collect(),
        tool_outputs: message.tool_outputs.clone(),
    }
}
