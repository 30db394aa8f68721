//! # Live Connection
//!
//! One persistent bidirectional websocket per session. After the handshake the socket
//! is split into two tasks:
//!
//! - **writer**: drains encoded microphone frames into `realtimeInput` messages and
//!   sends the close frame when the session asks for it
//! - **reader**: parses every inbound message into [`LiveEvent`]s, in order
//!
//! The session controller only sees the channel ends in [`LiveConnection`], so tests
//! swap in an in-memory transport through the [`LiveTransport`] trait.

use crate::audio::capture::EncodedFrame;
use crate::error::SessionError;
use crate::live::protocol::{parse_server_message, LiveEvent, RealtimeInputMessage, SetupMessage};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

const AUDIO_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Asks the writer task to close the socket.
#[derive(Debug)]
pub struct ConnectionCloser {
    tx: Option<oneshot::Sender<()>>,
}

impl ConnectionCloser {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Close the connection. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An open streaming session with the live service.
pub struct LiveConnection {
    /// Encoded microphone frames to send
    pub audio: mpsc::Sender<EncodedFrame>,
    /// Everything the service says, in arrival order
    pub events: mpsc::Receiver<LiveEvent>,
    pub closer: ConnectionCloser,
}

/// Opens live connections.
pub trait LiveTransport: Send + Sync {
    /// Connect, send `setup`, and resolve once the service confirms it.
    fn connect(&self, setup: SetupMessage) -> BoxFuture<'static, Result<LiveConnection, SessionError>>;
}

/// Read until the service acknowledges the setup message.
async fn wait_for_setup<S>(stream: &mut S) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|_| SessionError::Protocol("Binary message is not UTF-8".to_string()))?,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(SessionError::Connection(format!(
                    "Service closed the connection during setup: {}",
                    reason
                )));
            }
            _ => continue,
        };
        if parse_server_message(&text)?.setup_complete {
            return Ok(());
        }
        debug!("Ignoring message received before setup completed");
    }
    Err(SessionError::Connection(
        "Connection ended before setup completed".to_string(),
    ))
}

/// The real thing: a websocket to the service's BidiGenerateContent endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint: String,
    api_key: String,
}

impl WebSocketTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Endpoint with the API key as a percent-encoded `key` query parameter.
    fn url(&self) -> Result<String, SessionError> {
        let url = reqwest::Url::parse_with_params(&self.endpoint, &[("key", &self.api_key)])
            .map_err(|e| SessionError::Config(format!("Invalid live endpoint: {}", e)))?;
        Ok(url.into())
    }
}

impl LiveTransport for WebSocketTransport {
    fn connect(&self, setup: SetupMessage) -> BoxFuture<'static, Result<LiveConnection, SessionError>> {
        let url = self.url();
        let has_key = !self.api_key.is_empty();
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            if !has_key {
                return Err(SessionError::Config("Live API key is not configured".to_string()));
            }

            let url = url?;
            info!(endpoint = %endpoint, model = %setup.setup.model, "Connecting to live service");
            let (socket, _) = connect_async(url).await?;
            let (mut sink, mut stream) = socket.split();

            let payload = serde_json::to_string(&setup)
                .map_err(|e| SessionError::Protocol(format!("Failed to encode setup: {}", e)))?;
            sink.send(Message::Text(payload)).await?;

            tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup(&mut stream))
                .await
                .map_err(|_| SessionError::Connection("Timed out waiting for setup".to_string()))??;

            info!("Live session setup complete");

            let (audio_tx, mut audio_rx) = mpsc::channel::<EncodedFrame>(AUDIO_QUEUE);
            let (events_tx, events_rx) = mpsc::channel::<LiveEvent>(EVENT_QUEUE);
            let (close_tx, mut close_rx) = oneshot::channel::<()>();

            // Writer
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut close_rx => break,
                        frame = audio_rx.recv() => {
                            let Some(frame) = frame else { break };
                            let message = RealtimeInputMessage::from(frame);
                            let payload = match serde_json::to_string(&message) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    error!("Failed to encode audio frame: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(payload)).await {
                                warn!("Failed to send audio frame: {}", e);
                                break;
                            }
                        }
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                debug!("Live connection writer finished");
            });

            // Reader
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                let _ = events_tx
                                    .send(LiveEvent::Error("Binary message is not UTF-8".to_string()))
                                    .await;
                                return;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty());
                            let _ = events_tx.send(LiveEvent::Closed(reason)).await;
                            return;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = events_tx.send(LiveEvent::Error(e.to_string())).await;
                            return;
                        }
                    };

                    let events = match parse_server_message(&text) {
                        Ok(frame) => frame.events,
                        Err(e) => vec![LiveEvent::Error(e.to_string())],
                    };
                    for event in events {
                        if events_tx.send(event).await.is_err() {
                            debug!("Session stopped listening, reader exiting");
                            return;
                        }
                    }
                }
                let _ = events_tx.send(LiveEvent::Closed(None)).await;
            });

            Ok(LiveConnection {
                audio: audio_tx,
                events: events_rx,
                closer: ConnectionCloser::new(close_tx),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_carries_key() {
        let transport = WebSocketTransport::new("wss://live.example/ws", "secret");
        assert_eq!(transport.url().unwrap(), "wss://live.example/ws?key=secret");
    }

    #[test]
    fn test_url_encodes_key() {
        let transport = WebSocketTransport::new("wss://live.example/ws", "a&b=c d/+");
        assert_eq!(transport.url().unwrap(), "wss://live.example/ws?key=a%26b%3Dc+d%2F%2B");

        let broken = WebSocketTransport::new("not a url", "secret");
        assert!(matches!(broken.url(), Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_without_key_fails_fast() {
        let transport = WebSocketTransport::new("wss://live.example/ws", "");
        let setup = SetupMessage::new("models/live-test", "Zephyr", String::new());
        let result = transport.connect(setup).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_wait_for_setup_skips_until_ack() {
        let mut stream = futures_util::stream::iter(vec![
            Ok::<_, WsError>(Message::Ping(vec![1])),
            Ok(Message::Text(r#"{"usageMetadata": {}}"#.to_string())),
            Ok(Message::Binary(br#"{"setupComplete": {}}"#.to_vec())),
        ]);
        assert!(wait_for_setup(&mut stream).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_setup_fails_on_close() {
        let mut stream = futures_util::stream::iter(vec![Ok::<_, WsError>(Message::Close(None))]);
        assert!(matches!(
            wait_for_setup(&mut stream).await,
            Err(SessionError::Connection(_))
        ));

        let mut empty = futures_util::stream::iter(Vec::<Result<Message, WsError>>::new());
        assert!(wait_for_setup(&mut empty).await.is_err());
    }

    #[tokio::test]
    async fn test_closer_is_idempotent() {
        let (tx, rx) = oneshot::channel();
        let mut closer = ConnectionCloser::new(tx);
        closer.close();
        closer.close();
        assert!(rx.await.is_ok());
    }
}
