use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ChatRequest, ChatResponseBody, StopRequest, StreamEvent};
use crate::core::content::Content;
use crate::core::error::{classify_error_body, TargetError};
use crate::core::turn::TargetId;
use crate::utils::url::construct_api_url;

/// Correlates a transport update with the turn and target it belongs to.
/// Events addressed to a turn that is no longer active are discarded by the
/// engine, never applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamKey {
    pub turn_id: u64,
    pub target: TargetId,
}

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Event(StreamEvent),
    Failed(TargetError),
}

#[derive(Debug)]
pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub request: ChatRequest,
    pub cancel: CancellationToken,
    pub key: StreamKey,
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(
    payload: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, StreamKey)>,
    key: &StreamKey,
) -> bool {
    if payload == "[DONE]" {
        // Terminator without an explicit final event: settle with empty
        // final content so the streamed text stands.
        let _ = tx.send((
            StreamMessage::Event(StreamEvent::Final(Content::default())),
            key.clone(),
        ));
        return true;
    }

    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => {
            let terminal = matches!(event, StreamEvent::Final(_));
            let _ = tx.send((StreamMessage::Event(event), key.clone()));
            terminal
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }

            let _ = tx.send((StreamMessage::Failed(classify_error_body(payload)), key.clone()));
            true
        }
    }
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, StreamKey)>,
    key: &StreamKey,
) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, key))
        .unwrap_or(false)
}

/// Replay a non-streaming response body as the equivalent event sequence so
/// the engine folds both transports through one path.
fn emit_response_body(
    tx: &mpsc::UnboundedSender<(StreamMessage, StreamKey)>,
    key: &StreamKey,
    body: ChatResponseBody,
) {
    if let Some(meta) = body.conversation {
        let _ = tx.send((
            StreamMessage::Event(StreamEvent::Conversation(meta)),
            key.clone(),
        ));
    }
    for (position, mut delta) in body.tool_calls.into_iter().enumerate() {
        if delta.index.is_none() {
            delta.index = Some(position as u32);
        }
        let _ = tx.send((StreamMessage::Event(StreamEvent::ToolCall(delta)), key.clone()));
    }
    for output in body.tool_outputs {
        let _ = tx.send((
            StreamMessage::Event(StreamEvent::ToolOutput(output)),
            key.clone(),
        ));
    }
    if let Some(usage) = body.usage {
        let _ = tx.send((StreamMessage::Event(StreamEvent::Usage(usage)), key.clone()));
    }
    let _ = tx.send((
        StreamMessage::Event(StreamEvent::Final(body.content.unwrap_or_default())),
        key.clone(),
    ));
}

/// Transport service: spawns one task per dispatched request and forwards
/// typed events, tagged with their stream key, over a single channel.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, StreamKey)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, StreamKey)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_request(&self, params: StreamParams) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                api_key,
                request,
                cancel,
                key,
            } = params;

            let cancel_key = key.clone();
            tokio::select! {
                _ = run_request(&tx, client, base_url, api_key, request, cancel.clone(), &key) => {}
                _ = cancel.cancelled() => {
                    let _ = tx.send((StreamMessage::Failed(TargetError::Cancelled), cancel_key));
                }
            }
        });
    }

    #[cfg(test)]
    pub fn send_for_test(&self, message: StreamMessage, key: StreamKey) {
        let _ = self.tx.send((message, key));
    }
}

async fn run_request(
    tx: &mpsc::UnboundedSender<(StreamMessage, StreamKey)>,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request: ChatRequest,
    cancel: CancellationToken,
    key: &StreamKey,
) {
    let chat_url = construct_api_url(&base_url, "chat");
    let mut http_request = client
        .post(chat_url)
        .header("Content-Type", "application/json");
    if !api_key.is_empty() {
        http_request = http_request.bearer_auth(&api_key);
    }

    let streaming = request.stream;
    let response = match http_request.json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send((
                StreamMessage::Failed(TargetError::Transport(e.to_string())),
                key.clone(),
            ));
            return;
        }
    };

    if !response.status().is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let _ = tx.send((StreamMessage::Failed(classify_error_body(&error_text)), key.clone()));
        return;
    }

    if !streaming {
        match response.json::<ChatResponseBody>().await {
            Ok(body) => emit_response_body(tx, key, body),
            Err(e) => {
                let _ = tx.send((
                    StreamMessage::Failed(TargetError::Transport(e.to_string())),
                    key.clone(),
                ));
            }
        }
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return;
        }

        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send((
                    StreamMessage::Failed(TargetError::Transport(e.to_string())),
                    key.clone(),
                ));
                return;
            }
        };
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line_str = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(s) => s.trim(),
                Err(e) => {
                    debug!(error = %e, "invalid UTF-8 in stream, dropping line");
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };

            let should_end = process_sse_line(line_str, tx, key);
            buffer.drain(..=newline_pos);
            if should_end {
                return;
            }
        }
    }

    // The connection closed before any terminal event arrived.
    let _ = tx.send((
        StreamMessage::Failed(TargetError::Transport(
            "stream ended before a final event".to_string(),
        )),
        key.clone(),
    ));
}

/// Best-effort out-of-band interrupt of server-side generation. Local
/// cancellation is authoritative; failures here are only logged.
pub fn spawn_stop_request(
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_id: String,
) {
    tokio::spawn(async move {
        let stop_url = construct_api_url(&base_url, "chat/stop");
        let mut http_request = client
            .post(stop_url)
            .header("Content-Type", "application/json");
        if !api_key.is_empty() {
            http_request = http_request.bearer_auth(&api_key);
        }

        let body = StopRequest {
            request_id: request_id.clone(),
        };
        if let Err(e) = http_request.json(&body).send().await {
            debug!(request_id = %request_id, error = %e, "stop notification failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UsageStats;

    fn test_key(turn_id: u64) -> StreamKey {
        StreamKey {
            turn_id,
            target: TargetId::Primary,
        }
    }

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let (service, mut rx) = ChatStreamService::new();
        let variants = [
            (r#"data: {"type":"text","value":"Hello"}"#, "Hello"),
            (r#"data:{"type":"text","value":"World"}"#, "World"),
        ];

        for (index, (chunk_line, expected_chunk)) in variants.iter().enumerate() {
            let key = test_key((index + 1) as u64);

            assert!(!process_sse_line(chunk_line, &service.tx, &key));
            let (message, received_key) = rx.try_recv().expect("expected text event");
            assert_eq!(received_key, key);
            match message {
                StreamMessage::Event(StreamEvent::Text(content)) => {
                    assert_eq!(content, *expected_chunk)
                }
                other => panic!("expected text event, got {:?}", other),
            }
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn done_marker_synthesizes_empty_final() {
        let (service, mut rx) = ChatStreamService::new();
        let key = test_key(7);

        assert!(process_sse_line("data: [DONE]", &service.tx, &key));
        let (message, _) = rx.try_recv().expect("expected final event");
        match message {
            StreamMessage::Event(StreamEvent::Final(content)) => assert!(content.is_empty()),
            other => panic!("expected final event, got {:?}", other),
        }
    }

    #[test]
    fn final_event_ends_the_stream() {
        let (service, mut rx) = ChatStreamService::new();
        let key = test_key(7);

        assert!(process_sse_line(
            r#"data: {"type":"final","value":"done"}"#,
            &service.tx,
            &key
        ));
        let (message, _) = rx.try_recv().expect("expected final event");
        assert!(matches!(
            message,
            StreamMessage::Event(StreamEvent::Final(_))
        ));
    }

    #[test]
    fn error_payloads_classify_and_terminate() {
        let (service, mut rx) = ChatStreamService::new();
        let key = test_key(9);
        let error_line = r#"data: {"error":{"message":"internal server error"}}"#;

        assert!(process_sse_line(error_line, &service.tx, &key));

        let (message, received_key) = rx.try_recv().expect("expected failure");
        assert_eq!(received_key, key);
        match message {
            StreamMessage::Failed(TargetError::UpstreamApi(text)) => {
                assert!(text.starts_with("API Error: internal server error"));
            }
            other => panic!("expected upstream failure, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_event_lines_are_ignored() {
        let (service, mut rx) = ChatStreamService::new();
        let key = test_key(3);

        assert!(!process_sse_line(": keep-alive", &service.tx, &key));
        assert!(!process_sse_line("", &service.tx, &key));
        assert!(!process_sse_line("data:", &service.tx, &key));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn response_body_replays_as_ordered_events() {
        let (service, mut rx) = ChatStreamService::new();
        let key = test_key(4);
        let body = ChatResponseBody {
            content: Some(Content::text("full answer")),
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
            usage: Some(UsageStats {
                completion_tokens: Some(5),
                ..UsageStats::default()
            }),
            conversation: None,
        };

        emit_response_body(&service.tx, &key, body);

        let (first, _) = rx.try_recv().expect("usage event");
        assert!(matches!(first, StreamMessage::Event(StreamEvent::Usage(_))));
        let (second, _) = rx.try_recv().expect("final event");
        match second {
            StreamMessage::Event(StreamEvent::Final(content)) => {
                assert_eq!(content.flatten_text(), "full answer")
            }
            other => panic!("expected final event, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
