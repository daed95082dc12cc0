//! Server-Sent Events inbound channel
//!
//! Each `data:` payload is an inbound event in the same JSON shape the STOMP
//! topics carry, so both feed one pipeline.

use super::reconnect::{ReconnectPolicy, ReconnectTracker};
use super::TransportError;
use crate::protocol::InboundEvent;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder; chunks may split lines or UTF-8 sequences anywhere
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id and retry are not used by this backend
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

/// Long-lived `GET` event-stream subscription
pub struct SseSubscriber {
    client: Client,
    url: String,
    policy: ReconnectPolicy,
}

impl SseSubscriber {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            policy,
        }
    }

    /// Stream events until cancelled or reconnect attempts are exhausted
    pub async fn run(self, events: mpsc::UnboundedSender<InboundEvent>, cancel: CancellationToken) {
        let mut tracker = ReconnectTracker::new(self.policy);
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = self.stream_once(&events, &mut tracker) => result,
            };
            if let Err(e) = result {
                tracing::warn!(url = %self.url, error = %e, "SSE stream failed");
            }
            if events.is_closed() {
                return;
            }
            let Some(delay) = tracker.next_delay() else {
                tracing::warn!(url = %self.url, "SSE reconnect attempts exhausted");
                return;
            };
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_once(
        &self,
        events: &mpsc::UnboundedSender<InboundEvent>,
        tracker: &mut ReconnectTracker,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        if !response.status().is_success() {
            return Err(TransportError::from_status(
                response.status().as_u16(),
                "event stream rejected",
            ));
        }
        tracing::info!(url = %self.url, "SSE stream open");
        tracker.reset();

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::from_reqwest(&e))?;
            for frame in decoder.push(&chunk) {
                match InboundEvent::parse(&frame.data) {
                    Ok(event) => {
                        if events.send(event).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, event = ?frame.event, "Ignoring SSE payload");
                    }
                }
            }
        }
        Err(TransportError::network("SSE stream ended"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("message".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn test_chunks_split_anywhere() {
        let mut decoder = SseDecoder::new();
        let input = "data: {\"type\":\"response\",\"content\":\"日本\"}\r\n\r\n".as_bytes();
        let mut frames = Vec::new();
        for chunk in input.chunks(3) {
            frames.extend(decoder.push(chunk));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"type\":\"response\",\"content\":\"日本\"}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keepalive\n\ndata: line one\ndata:line two\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line one\nline two");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn test_incomplete_event_is_held() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: partial\n").is_empty());
        assert_eq!(decoder.push(b"\n").len(), 1);
    }
}
