//! Event-stream relay.
//!
//! Upstream bytes are split into lines and each line is forwarded as soon as
//! it is complete, re-terminated with the blank-line event delimiter. Only the
//! most recent non-terminal `data:` payload is retained, so memory stays bounded
//! to one event however long the stream runs.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Terminal payload of an event stream.
pub const DONE_MARKER: &str = "[DONE]";

const EVENT_DELIMITER: &[u8] = b"\n\n";

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if !line.is_empty() {
                lines.push(line.freeze());
            }
        }
        lines
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<Bytes> {
        let mut rest = self.buf.split();
        if rest.last() == Some(&b'\r') {
            rest.truncate(rest.len() - 1);
        }
        (!rest.is_empty()).then(|| rest.freeze())
    }
}

/// Re-terminate a line as a complete event.
pub fn frame(line: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(line.len() + EVENT_DELIMITER.len());
    out.extend_from_slice(line);
    out.extend_from_slice(EVENT_DELIMITER);
    out.freeze()
}

/// Payload of a `data:` line, without the field name and its optional space.
pub fn data_payload(line: &[u8]) -> Option<&[u8]> {
    let rest = line.strip_prefix(b"data:")?;
    Some(rest.strip_prefix(b" ").unwrap_or(rest))
}

/// Remembers the last `data:` payload that is not the terminal marker.
#[derive(Debug, Default)]
pub struct LastPayload {
    payload: Option<String>,
    done: bool,
}

impl LastPayload {
    /// Record a line; returns true once the terminal marker has been seen.
    pub fn observe(&mut self, line: &[u8]) -> bool {
        if let Some(payload) = data_payload(line) {
            let payload = String::from_utf8_lossy(payload);
            if payload.trim() == DONE_MARKER {
                self.done = true;
            } else {
                self.payload = Some(payload.into_owned());
            }
        }
        self.done
    }

    pub fn into_inner(self) -> Option<String> {
        self.payload
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnd {
    /// Last non-terminal `data:` payload seen, if any.
    pub last_payload: Option<String>,
    /// The client went away before the stream finished.
    pub client_disconnected: bool,
}

/// Relay `upstream` to the client as a response body.
///
/// Runs on its own task; `on_end` is invoked once the upstream closes, sends
/// the terminal marker, errors, or the client disconnects. Dropping the
/// upstream stream on disconnect closes the upstream connection.
pub fn relay<S, E, F>(upstream: S, on_end: F) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce(StreamEnd) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut splitter = LineSplitter::new();
        let mut tail = LastPayload::default();
        let mut client_disconnected = false;

        'read: loop {
            let chunk = tokio::select! {
                _ = tx.closed() => {
                    client_disconnected = true;
                    break 'read;
                }
                chunk = upstream.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::error!("Upstream stream error: {}", e);
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
                None => {
                    if let Some(line) = splitter.finish() {
                        tail.observe(&line);
                        if tx.send(Ok(frame(&line))).await.is_err() {
                            client_disconnected = true;
                        }
                    }
                    break;
                }
            };

            for line in splitter.push(&chunk) {
                let done = tail.observe(&line);
                if tx.send(Ok(frame(&line))).await.is_err() {
                    client_disconnected = true;
                    break 'read;
                }
                if done {
                    break 'read;
                }
            }
        }

        drop(upstream);
        if client_disconnected {
            tracing::info!("Client disconnected mid-stream, closed upstream connection");
        }

        on_end(StreamEnd {
            last_payload: tail.into_inner(),
            client_disconnected,
        });
    });

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    const FIRST: &str = r#"data: {"choices":[{"delta":{"content":"a"}}]}"#;
    const SECOND: &str = r#"data: {"choices":[{"delta":{"content":"b"}}]}"#;

    #[test]
    fn splits_lines_across_chunks() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(b"data: {\"a\"").is_empty());
        let lines = splitter.push(b":1}\n\ndata: [DO");
        assert_eq!(lines, vec![Bytes::from_static(b"data: {\"a\":1}")]);

        let lines = splitter.push(b"NE]\r\n");
        assert_eq!(lines, vec![Bytes::from_static(b"data: [DONE]")]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn finish_returns_unterminated_tail() {
        let mut splitter = LineSplitter::new();
        splitter.push(b": OPENROUTER PROCESSING\ndata: partial");
        assert_eq!(splitter.finish(), Some(Bytes::from_static(b"data: partial")));
    }

    #[test]
    fn extracts_data_payload() {
        assert_eq!(data_payload(b"data: {}"), Some(&b"{}"[..]));
        assert_eq!(data_payload(b"data:{}"), Some(&b"{}"[..]));
        assert_eq!(data_payload(b": keep-alive"), None);
    }

    #[test]
    fn last_payload_skips_done_marker_and_comments() {
        let mut tail = LastPayload::default();
        assert!(!tail.observe(FIRST.as_bytes()));
        assert!(!tail.observe(SECOND.as_bytes()));
        assert!(!tail.observe(b": OPENROUTER PROCESSING"));
        assert!(tail.observe(b"data: [DONE]"));

        assert_eq!(tail.into_inner().as_deref(), Some(&SECOND[6..]));
    }

    #[tokio::test]
    async fn relays_events_in_order_and_retains_last_payload() {
        let input = format!("{}\n\n{}\n\ndata: [DONE]\n\n", FIRST, SECOND);
        // Split mid-event to exercise carry-over.
        let (a, b) = input.split_at(20);
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from(a.to_string())),
            Ok(Bytes::from(b.to_string())),
        ];

        let (end_tx, end_rx) = oneshot::channel();
        let body = relay(futures::stream::iter(chunks), move |end| {
            let _ = end_tx.send(end);
        });

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), input);

        let end = end_rx.await.unwrap();
        assert_eq!(end.last_payload.as_deref(), Some(&SECOND[6..]));
        assert!(!end.client_disconnected);
    }

    #[tokio::test]
    async fn stream_without_data_reports_no_payload() {
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(b": ping\n\n"))];

        let (end_tx, end_rx) = oneshot::channel();
        let body = relay(futures::stream::iter(chunks), move |end| {
            let _ = end_tx.send(end);
        });

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b": ping\n\n");
        assert_eq!(end_rx.await.unwrap().last_payload, None);
    }

    #[tokio::test]
    async fn dropped_client_closes_idle_upstream() {
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from(format!("{}\n", FIRST)))];
        let upstream = futures::stream::iter(chunks).chain(futures::stream::pending());

        let (end_tx, end_rx) = oneshot::channel();
        let body = relay(Box::pin(upstream), move |end| {
            let _ = end_tx.send(end);
        });

        let mut frames = body.into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first, frame(FIRST.as_bytes()));
        drop(frames);

        let end = tokio::time::timeout(std::time::Duration::from_secs(1), end_rx)
            .await
            .expect("relay must stop once the client is gone")
            .unwrap();
        assert!(end.client_disconnected);
        assert_eq!(end.last_payload.as_deref(), Some(&FIRST[6..]));
    }
}
