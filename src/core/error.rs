use thiserror::Error;

/// Classification of a per-target request failure. Primary failures stop the
/// turn; comparison failures only mark their own result slot.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TargetError {
    /// The provider/model cannot stream. Grounds the one-time non-streaming
    /// retry for the primary target.
    #[error("{0}")]
    StreamingUnsupported(String),

    /// The backend reached the model provider and got an error back.
    #[error("{0}")]
    UpstreamApi(String),

    /// The request was aborted locally. A clean settle, not a failure.
    #[error("Request cancelled")]
    Cancelled,

    /// Network failure, malformed response, anything else.
    #[error("{0}")]
    Transport(String),
}

impl TargetError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TargetError::Cancelled)
    }

    pub fn is_streaming_unsupported(&self) -> bool {
        matches!(self, TargetError::StreamingUnsupported(_))
    }
}

/// Classify an error body returned by the backend. Streaming-unsupported
/// signals are detected on the raw body; everything else is an upstream API
/// error carrying the formatted body.
pub fn classify_error_body(body: &str) -> TargetError {
    let formatted = format_api_error(body);
    if is_streaming_unsupported_error(body) {
        TargetError::StreamingUnsupported(formatted)
    } else {
        TargetError::UpstreamApi(formatted)
    }
}

/// True when an error message indicates the chosen provider/model rejects
/// streamed responses, as opposed to merely mentioning streams in passing.
pub fn is_streaming_unsupported_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    let mentions_streaming = lower.contains("stream");
    if !mentions_streaming {
        return false;
    }

    let unsupported_signals = [
        "not supported",
        "unsupported",
        "unknown field",
        "unknown parameter",
        "unrecognized",
        "unexpected field",
        "invalid parameter",
        "does not support",
        "must be false",
        "disabled",
    ];

    unsupported_signals
        .iter()
        .any(|signal| lower.contains(signal))
}

/// Pull a one-line summary out of an error body, preferring the nested
/// upstream detail over a generic body message over nothing.
fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Format an error payload for display: JSON bodies are pretty-printed with
/// a summary line when one can be extracted, XML-ish bodies are fenced as
/// xml, anything else is fenced plain.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}
