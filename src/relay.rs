use std::{sync::Arc, time::Duration};

use futures_util::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    backend::{request::UpstreamRequest, BackendError, ChatTransport, UpstreamStream},
    config::RelayConfig,
    models::StreamEvent,
};

const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Skip,
    Done,
    Chunk {
        events: Vec<StreamEvent>,
        finished: bool,
    },
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

pub fn decode_line(line: &str) -> LineOutcome {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return LineOutcome::Skip;
    }

    let Some(payload) = line.strip_prefix("data: ") else {
        debug!(line, "ignoring non-data line from upstream");
        return LineOutcome::Skip;
    };
    if payload.trim() == "[DONE]" {
        return LineOutcome::Done;
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(error) => {
            warn!(error = %error, payload, "skipping malformed upstream chunk");
            return LineOutcome::Skip;
        }
    };

    let Some(choice) = chunk.choices.into_iter().next() else {
        return LineOutcome::Skip;
    };

    LineOutcome::Chunk {
        events: delta_events(choice.delta.unwrap_or_default()),
        finished: choice
            .finish_reason
            .as_ref()
            .is_some_and(|reason| !reason.is_null()),
    }
}

// Provider-specific fields are mapped here and nowhere else.
fn delta_events(delta: Delta) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(2);
    if let Some(reasoning) = delta.reasoning_content.filter(|value| !value.is_empty()) {
        events.push(StreamEvent::Reasoning(reasoning));
    }
    if let Some(content) = delta.content.filter(|value| !value.is_empty()) {
        events.push(StreamEvent::Token(content));
    }
    events
}

fn decode_raw_line(line: &[u8]) -> LineOutcome {
    match std::str::from_utf8(line) {
        Ok(text) => decode_line(text),
        Err(error) => {
            warn!(error = %error, "skipping upstream line with invalid UTF-8");
            LineOutcome::Skip
        }
    }
}

/// Ends on `[DONE]`, on a chunk carrying a `finish_reason`, at EOF, or after
/// a single terminal `Error` event.
pub fn decode_events(
    mut upstream: UpstreamStream,
    idle_timeout: Duration,
) -> BoxStream<'static, StreamEvent> {
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes of `buffer` already known to hold no newline.
        let mut scanned = 0;

        loop {
            let next = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield StreamEvent::Error(format!(
                        "upstream sent nothing for {}s; generation aborted",
                        idle_timeout.as_secs()
                    ));
                    return;
                }
            };

            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(error)) => {
                    yield StreamEvent::Error(failure_message(&error));
                    return;
                }
                None => break,
            };
            buffer.extend_from_slice(&bytes);

            let mut consumed = 0;
            while let Some(offset) = buffer[scanned..].iter().position(|byte| *byte == b'\n') {
                let end = scanned + offset;
                let outcome = decode_raw_line(&buffer[consumed..=end]);
                consumed = end + 1;
                scanned = consumed;
                match outcome {
                    LineOutcome::Skip => {}
                    LineOutcome::Done => {
                        debug!("upstream signalled [DONE]");
                        return;
                    }
                    LineOutcome::Chunk { events, finished } => {
                        for event in events {
                            yield event;
                        }
                        if finished {
                            debug!("upstream chunk carried finish_reason");
                            return;
                        }
                    }
                }
            }
            buffer.drain(..consumed);
            scanned = buffer.len();

            if buffer.len() > MAX_LINE_BYTES {
                let error = BackendError::MalformedPayload(format!(
                    "line exceeded {MAX_LINE_BYTES} bytes without a newline"
                ));
                warn!(buffered = buffer.len(), "upstream line too long");
                yield StreamEvent::Error(failure_message(&error));
                return;
            }
        }

        // Final line without a trailing newline.
        if let LineOutcome::Chunk { events, .. } = decode_raw_line(&buffer) {
            for event in events {
                yield event;
            }
        }
    };

    stream.boxed()
}

pub fn failure_message(error: &BackendError) -> String {
    match error {
        BackendError::Http { status, detail } => {
            format!("upstream API error (status {status}): {detail}")
        }
        BackendError::Transport(message) => {
            format!("failed to reach upstream API: {message}")
        }
        BackendError::Timeout(message) => format!("upstream API timed out: {message}"),
        BackendError::MalformedPayload(message) => {
            format!("upstream API sent an unreadable response: {message}")
        }
    }
}

/// Dropping the returned receiver cancels the producer task and releases the
/// upstream connection.
pub fn spawn(
    transport: Arc<dyn ChatTransport>,
    request: UpstreamRequest,
    config: RelayConfig,
) -> ReceiverStream<StreamEvent> {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

    tokio::spawn(async move {
        let open = tokio::time::timeout(config.stream_idle_timeout, transport.open_stream(request));
        let opened = tokio::select! {
            _ = tx.closed() => {
                debug!("client went away before upstream responded");
                return;
            }
            opened = open => opened,
        };

        let upstream = match opened {
            Ok(Ok(upstream)) => upstream,
            Err(_) => {
                warn!(transport = transport.name(), "upstream did not answer the stream request");
                let message = format!(
                    "upstream did not respond within {}s; generation aborted",
                    config.stream_idle_timeout.as_secs()
                );
                let _ = tx.send(StreamEvent::Error(message)).await;
                return;
            }
            Ok(Err(error)) => {
                warn!(transport = transport.name(), error = %error, "upstream stream failed to open");
                let _ = tx.send(StreamEvent::Error(failure_message(&error))).await;
                return;
            }
        };

        let mut events = decode_events(upstream, config.stream_idle_timeout);
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!("client disconnected; releasing upstream");
                    break;
                }
                next = events.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("relay finished");
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;
    use crate::backend::{
        mock::{CompletionScript, ScriptedTransport, StreamScript},
        registry::BackendTarget,
        request,
    };

    fn body(lines: &[&str]) -> UpstreamStream {
        let chunks = lines
            .iter()
            .map(|line| Ok(format!("{line}\n").into_bytes()))
            .collect::<Vec<_>>();
        stream::iter(chunks).boxed()
    }

    async fn collect(upstream: UpstreamStream) -> Vec<StreamEvent> {
        decode_events(upstream, Duration::from_secs(5))
            .collect::<Vec<_>>()
            .await
    }

    fn token(text: &str) -> StreamEvent {
        StreamEvent::Token(text.to_owned())
    }

    fn reasoning(text: &str) -> StreamEvent {
        StreamEvent::Reasoning(text.to_owned())
    }

    #[test]
    fn decode_line_handles_framing() {
        assert_eq!(decode_line(""), LineOutcome::Skip);
        assert_eq!(decode_line(": keep-alive"), LineOutcome::Skip);
        assert_eq!(decode_line("event: ping"), LineOutcome::Skip);
        assert_eq!(decode_line("data: [DONE]"), LineOutcome::Done);
        assert_eq!(decode_line("data:  [DONE] \r"), LineOutcome::Done);
        assert_eq!(decode_line("data: {not json"), LineOutcome::Skip);
        assert_eq!(decode_line(r#"data: {"choices":[]}"#), LineOutcome::Skip);
    }

    #[test]
    fn data_prefix_requires_a_space() {
        assert_eq!(
            decode_line(r#"data:{"choices":[{"delta":{"content":"x"}}]}"#),
            LineOutcome::Skip
        );
        assert_eq!(decode_line("data:[DONE]"), LineOutcome::Skip);
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#),
            LineOutcome::Chunk {
                events: vec![token("x")],
                finished: false,
            }
        );
    }

    #[test]
    fn decode_line_emits_reasoning_before_content() {
        let outcome = decode_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"think","content":"say"},"finish_reason":null}]}"#,
        );
        assert_eq!(
            outcome,
            LineOutcome::Chunk {
                events: vec![reasoning("think"), token("say")],
                finished: false,
            }
        );
    }

    #[test]
    fn decode_line_drops_empty_deltas() {
        let outcome = decode_line(r#"data: {"choices":[{"delta":{"content":"","role":"assistant"}}]}"#);
        assert_eq!(
            outcome,
            LineOutcome::Chunk {
                events: vec![],
                finished: false,
            }
        );
    }

    #[tokio::test]
    async fn well_formed_stream_emits_deltas_in_order() {
        let events = collect(body(&[
            ": OPENROUTER PROCESSING",
            "",
            r#"data: {"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"Once"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":" upon"}}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(events, vec![reasoning("hmm"), token("Once"), token(" upon")]);
    }

    #[tokio::test]
    async fn malformed_chunk_is_skipped() {
        let events = collect(body(&[
            r#"data: {"choices":[{"delta":{"content":"a"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"#,
            r#"data: {"choices":[{"delta":{"content":"b"}}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(events, vec![token("a"), token("b")]);
    }

    #[tokio::test]
    async fn finish_reason_ends_sequence_before_done() {
        let events = collect(body(&[
            r#"data: {"choices":[{"delta":{"content":"end"},"finish_reason":"stop"}]}"#,
            r#"data: {"choices":[{"delta":{"content":"ignored"}}]}"#,
            "data: [DONE]",
        ]))
        .await;

        assert_eq!(events, vec![token("end")]);
    }

    #[tokio::test]
    async fn lines_split_across_reads_are_reassembled() {
        let middle = "tent\":\"\u{4f60}".as_bytes();
        let reads = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"con".to_vec()),
            Ok(middle[..8].to_vec()),
            Ok(middle[8..].to_vec()),
            Ok(b"\"}}]}\r\n\r\ndata: [DONE]\r\n".to_vec()),
        ];
        let events = collect(stream::iter(reads).boxed()).await;

        assert_eq!(events, vec![token("\u{4f60}")]);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_decoded() {
        let reads = vec![Ok(br#"data: {"choices":[{"delta":{"content":"tail"}}]}"#.to_vec())];
        let events = collect(stream::iter(reads).boxed()).await;

        assert_eq!(events, vec![token("tail")]);
    }

    #[tokio::test]
    async fn transport_failure_becomes_single_error_event() {
        let reads = vec![
            Ok(br#"data: {"choices":[{"delta":{"content":"partial"}}]}"#.to_vec()),
            Ok(b"\n".to_vec()),
            Err(BackendError::Transport("connection reset".to_owned())),
            Ok(br#"data: {"choices":[{"delta":{"content":"never"}}]}"#.to_vec()),
        ];
        let events = collect(stream::iter(reads).boxed()).await;

        assert_eq!(
            events,
            vec![
                token("partial"),
                StreamEvent::Error("failed to reach upstream API: connection reset".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let upstream = stream::pending::<Result<Vec<u8>, BackendError>>().boxed();
        let events = decode_events(upstream, Duration::from_millis(20))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
    }

    #[tokio::test]
    async fn overlong_line_becomes_error_event() {
        let reads = vec![
            Ok(vec![b'x'; MAX_LINE_BYTES / 2 + 1]),
            Ok(vec![b'x'; MAX_LINE_BYTES / 2 + 1]),
            Ok(br#"data: {"choices":[{"delta":{"content":"never"}}]}"#.to_vec()),
        ];
        let events = collect(stream::iter(reads).boxed()).await;

        assert_eq!(
            events,
            vec![StreamEvent::Error(format!(
                "upstream API sent an unreadable response: line exceeded {MAX_LINE_BYTES} bytes without a newline"
            ))]
        );
    }

    #[tokio::test]
    async fn many_lines_in_one_read_are_all_decoded() {
        let mut read = Vec::new();
        for index in 0..500 {
            read.extend_from_slice(
                format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{index}\"}}}}]}}\n\n").as_bytes(),
            );
        }
        read.extend_from_slice(b"data: [DONE]\n");
        let events = collect(stream::iter(vec![Ok(read)]).boxed()).await;

        assert_eq!(events.len(), 500);
        assert_eq!(events[499], token("499"));
    }

    fn target() -> BackendTarget {
        BackendTarget::Custom {
            id: "local".to_owned(),
            base_url: "http://127.0.0.1:9".to_owned(),
            path: String::new(),
            secret: String::new(),
            model_name: "m".to_owned(),
        }
    }

    #[tokio::test]
    async fn rejected_stream_reports_status_and_detail() {
        let transport = Arc::new(ScriptedTransport::new(
            StreamScript::Status {
                status: 401,
                body: r#"{"error":{"message":"No auth credentials found"}}"#.to_owned(),
            },
            CompletionScript::Timeout,
        ));
        let events = spawn(
            transport,
            request::build(&target(), "hi", 0.7, true),
            RelayConfig::default(),
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(
            events,
            vec![StreamEvent::Error(
                "upstream API error (status 401): No auth credentials found".to_owned()
            )]
        );
    }

    #[tokio::test]
    async fn unresponsive_upstream_times_out_before_headers() {
        let transport = Arc::new(ScriptedTransport::new(
            StreamScript::Unresponsive,
            CompletionScript::Timeout,
        ));
        let config = RelayConfig {
            stream_idle_timeout: Duration::from_millis(20),
            ..RelayConfig::default()
        };
        let events = spawn(transport, request::build(&target(), "hi", 0.7, true), config)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
    }

    #[tokio::test]
    async fn dropping_receiver_releases_upstream() {
        let transport = Arc::new(ScriptedTransport::new(
            StreamScript::Body {
                chunks: vec![r#"data: {"choices":[{"delta":{"content":"first"}}]}"#.to_owned() + "\n"],
                hold_open: true,
            },
            CompletionScript::Timeout,
        ));
        let mut events = spawn(
            transport.clone(),
            request::build(&target(), "hi", 0.7, true),
            RelayConfig::default(),
        );

        assert_eq!(events.next().await, Some(token("first")));
        drop(events);

        for _ in 0..100 {
            if transport.upstream_released() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("upstream stream was not released after client disconnect");
    }
}
