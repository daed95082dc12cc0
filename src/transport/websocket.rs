//! WebSocket dialer
//!
//! Bridges a `tokio-tungstenite` stream to a [`Link`]: one task writes queued
//! text frames, one task forwards received text. Either side ending closes the
//! link.

use super::connector::{Dialer, Link};
use super::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<Link, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::network(format!("WebSocket connect failed: {e}")))?;
        let (mut writer, mut reader) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = writer.send(Message::Text(text)).await {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if incoming_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!("Ignoring non-UTF-8 binary frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(url = %self.url, "WebSocket opened");
        Ok(Link { outgoing, incoming })
    }

    fn host(&self) -> String {
        host_of(&self.url)
    }
}

/// `host[:port]` of a URL, or the URL itself when it has no authority
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(|c: char| matches!(c, '/' | '?' | '#'))
        .next()
        .unwrap_or(rest)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("ws://localhost:8080/ws/websocket"), "localhost:8080");
        assert_eq!(host_of("wss://agent.example.com"), "agent.example.com");
        assert_eq!(host_of("localhost"), "localhost");
    }
}
