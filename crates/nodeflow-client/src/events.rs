//! Build event stream decoding.
//!
//! The build backend streams newline-delimited JSON objects of the form
//! `{"event": "<type>", "data": {...}}`.

use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nodeflow_core::types::{BuildEvent, NodeId, ValidationResult};

/// Splits a raw byte stream into complete lines.
#[derive(Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete, non-blank line.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        lines
    }

    /// Whatever is left once the stream ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VertexPayload {
    #[serde(default)]
    build_data: Option<VertexBuildData>,
}

#[derive(Debug, Deserialize)]
struct VertexBuildData {
    id: String,
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decoded line, before it is narrowed to the node the build stops at.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    VertexStarted(NodeId),
    VertexEnded(NodeId, ValidationResult),
    Error(String),
    End,
    Other(String),
}

/// Decode one NDJSON line.
pub fn parse_line(line: &str) -> serde_json::Result<BackendEvent> {
    let raw: RawEvent = serde_json::from_str(line)?;
    let event = match raw.event.as_str() {
        "build_start" => match raw.data.get("id").and_then(|v| v.as_str()) {
            Some(id) => BackendEvent::VertexStarted(NodeId::from_str(id)),
            None => BackendEvent::Other(raw.event),
        },
        "end_vertex" => {
            let payload: VertexPayload = serde_json::from_value(raw.data)?;
            match payload.build_data {
                Some(data) => {
                    let mut result = if data.valid {
                        ValidationResult::success(0)
                    } else {
                        ValidationResult::failure(error_text(data.params.as_ref()))
                    };
                    result.duration_ms = data.duration_ms;
                    if let Some(ts) = data.timestamp {
                        result.timestamp = ts;
                    }
                    BackendEvent::VertexEnded(NodeId::from_str(&data.id), result)
                }
                None => BackendEvent::Other(raw.event),
            }
        }
        "error" => BackendEvent::Error(error_text(raw.data.get("error"))),
        "end" => BackendEvent::End,
        _ => BackendEvent::Other(raw.event),
    };
    Ok(event)
}

fn error_text(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "unknown error".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Narrow a backend event to the lifecycle of `stop_node`.
///
/// Upstream vertices are built on the way but only the target node's status
/// is driven by this build. A stream-level error fails the target node.
pub fn to_build_event(event: BackendEvent, stop_node: &NodeId) -> Option<BuildEvent> {
    match event {
        BackendEvent::VertexStarted(id) if &id == stop_node => {
            Some(BuildEvent::Started { node_id: id })
        }
        BackendEvent::VertexEnded(id, result) if &id == stop_node => {
            Some(BuildEvent::Completed { node_id: id, result })
        }
        BackendEvent::Error(message) => Some(BuildEvent::Completed {
            node_id: stop_node.clone(),
            result: ValidationResult::failure(message),
        }),
        _ => None,
    }
}

/// Decode `stream` and forward the target node's events into `tx`.
///
/// Every build ends with exactly one terminal event for `stop_node`. When the
/// stream ends (an `end` event, EOF, or a transport error) before the backend
/// reported on the target, a failed `Completed` is sent in its place, carrying
/// the last upstream failure if there was one. When `cancel` fires first a
/// `Stopped` is sent.
///
/// Returns `true` when the backend itself delivered the terminal event.
pub async fn pump<S>(
    mut stream: S,
    stop_node: NodeId,
    tx: mpsc::Sender<BuildEvent>,
    cancel: CancellationToken,
) -> bool
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    let mut parser = NdjsonParser::new();
    let mut finished = false;
    let mut failure: Option<String> = None;

    'read: loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => {
                if !finished {
                    debug!(node = %stop_node, "Build stream cancelled");
                    forward(&tx, BuildEvent::Stopped { node_id: stop_node }).await;
                }
                return finished;
            }
        };

        let (lines, eof): (Vec<String>, bool) = match chunk {
            Some(Ok(bytes)) => (parser.feed(&String::from_utf8_lossy(&bytes)), false),
            Some(Err(e)) => {
                warn!(error = %e, "Build event stream failed");
                failure = Some(format!("Build event stream failed: {}", e));
                (parser.finish().into_iter().collect(), true)
            }
            None => (parser.finish().into_iter().collect(), true),
        };

        for line in lines {
            match parse_line(&line) {
                Ok(BackendEvent::End) => break 'read,
                Ok(BackendEvent::VertexEnded(id, result)) if id != stop_node && !result.success => {
                    failure = Some(format!(
                        "Upstream component {} failed: {}",
                        id,
                        result.error_message.as_deref().unwrap_or("unknown error")
                    ));
                }
                Ok(event) => {
                    if let Some(build_event) = to_build_event(event, &stop_node) {
                        finished |= matches!(build_event, BuildEvent::Completed { .. });
                        if tx.send(build_event).await.is_err() {
                            return finished;
                        }
                    }
                }
                Err(e) => debug!(error = %e, line = %line, "Skipping undecodable build event"),
            }
        }

        if eof {
            break;
        }
    }

    if !finished {
        let message = failure
            .unwrap_or_else(|| "Build ended without a result for this component".to_string());
        warn!(node = %stop_node, error = %message, "Build ended without a result");
        forward(
            &tx,
            BuildEvent::Completed {
                node_id: stop_node,
                result: ValidationResult::failure(message),
            },
        )
        .await;
    }

    finished
}

async fn forward(tx: &mpsc::Sender<BuildEvent>, event: BuildEvent) {
    if tx.send(event).await.is_err() {
        warn!("Build event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_ndjson_split_across_chunks() {
        let mut parser = NdjsonParser::new();
        assert!(parser.feed("{\"event\":\"build_st").is_empty());
        let lines = parser.feed("art\",\"data\":{\"id\":\"a\"}}\n\n{\"event\":\"end\"}");
        assert_eq!(lines, vec![r#"{"event":"build_start","data":{"id":"a"}}"#]);
        assert_eq!(parser.finish().as_deref(), Some(r#"{"event":"end"}"#));
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_parse_end_vertex() {
        let ok = parse_line(
            r#"{"event":"end_vertex","data":{"build_data":{"id":"n1","valid":true,"duration_ms":842}}}"#,
        )
        .unwrap();
        match ok {
            BackendEvent::VertexEnded(id, result) => {
                assert_eq!(id.as_str(), "n1");
                assert!(result.success);
                assert_eq!(result.duration_ms, Some(842));
            }
            other => panic!("unexpected {:?}", other),
        }

        let failed = parse_line(
            r#"{"event":"end_vertex","data":{"build_data":{"id":"n1","valid":false,"params":"missing api key"}}}"#,
        )
        .unwrap();
        match failed {
            BackendEvent::VertexEnded(_, result) => {
                assert!(!result.success);
                assert_eq!(result.error_message.as_deref(), Some("missing api key"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_only_target_node_events_forwarded() {
        let target = NodeId::from_str("n2");
        let upstream = BackendEvent::VertexStarted(NodeId::from_str("n1"));
        assert!(to_build_event(upstream, &target).is_none());

        let started = to_build_event(BackendEvent::VertexStarted(target.clone()), &target);
        assert_eq!(started, Some(BuildEvent::Started { node_id: target.clone() }));

        match to_build_event(BackendEvent::Error("boom".into()), &target) {
            Some(BuildEvent::Completed { node_id, result }) => {
                assert_eq!(node_id, target);
                assert_eq!(result.error_message.as_deref(), Some("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn pump_forwards_until_end() {
        let body = concat!(
            "{\"event\":\"vertices_sorted\",\"data\":{}}\n",
            "{\"event\":\"build_start\",\"data\":{\"id\":\"n2\"}}\n",
            "{\"event\":\"end_vertex\",\"data\":{\"build_data\":{\"id\":\"n2\",\"valid\":true,\"duration_ms\":10}}}\n",
            "{\"event\":\"end\",\"data\":{}}\n",
            "{\"event\":\"build_start\",\"data\":{\"id\":\"n2\"}}\n",
        );
        let (head, tail) = body.split_at(40);
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(head.to_string())),
            Ok(Bytes::from(tail.to_string())),
        ];
        let (tx, mut rx) = mpsc::channel(8);

        let finished = pump(
            futures::stream::iter(chunks),
            NodeId::from_str("n2"),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(finished);
        assert!(matches!(rx.recv().await, Some(BuildEvent::Started { .. })));
        assert!(matches!(rx.recv().await, Some(BuildEvent::Completed { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_failure_fails_target() {
        let body = concat!(
            "{\"event\":\"build_start\",\"data\":{\"id\":\"n2\"}}\n",
            "{\"event\":\"end_vertex\",\"data\":{\"build_data\":{\"id\":\"n1\",\"valid\":false,\"params\":\"missing api key\"}}}\n",
            "{\"event\":\"end\",\"data\":{}}\n",
        );
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from(body))];
        let (tx, mut rx) = mpsc::channel(8);

        let finished = pump(
            futures::stream::iter(chunks),
            NodeId::from_str("n2"),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(!finished);
        assert!(matches!(rx.recv().await, Some(BuildEvent::Started { .. })));
        match rx.recv().await {
            Some(BuildEvent::Completed { node_id, result }) => {
                assert_eq!(node_id.as_str(), "n2");
                assert!(!result.success);
                assert_eq!(
                    result.error_message.as_deref(),
                    Some("Upstream component n1 failed: missing api key")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn eof_without_result_fails_target() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from(
            "{\"event\":\"build_start\",\"data\":{\"id\":\"n2\"}}\n",
        ))];
        let (tx, mut rx) = mpsc::channel(8);

        pump(
            futures::stream::iter(chunks),
            NodeId::from_str("n2"),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(rx.recv().await, Some(BuildEvent::Started { .. })));
        match rx.recv().await {
            Some(BuildEvent::Completed { result, .. }) => {
                assert_eq!(
                    result.error_message.as_deref(),
                    Some("Build ended without a result for this component")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_stream_reports_stopped() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let finished = pump(
            futures::stream::pending::<Result<Bytes, reqwest::Error>>(),
            NodeId::from_str("n2"),
            tx,
            cancel,
        )
        .await;

        assert!(!finished);
        assert_eq!(
            rx.recv().await,
            Some(BuildEvent::Stopped { node_id: NodeId::from_str("n2") })
        );
        assert!(rx.recv().await.is_none());
    }
}
