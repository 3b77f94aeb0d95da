use crate::{config::RealtimeConfig, error::GatewayError};
use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// What the session sees coming from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// One live backend connection. Dropping `outbound` closes it.
pub struct RealtimeLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkMessage>,
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, call_id: &str, token: CancellationToken) -> Result<RealtimeLink>;
}

pub struct WebsocketConnector {
    url: String,
    model: String,
    api_key: String,
}

impl WebsocketConnector {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
        }
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        if !self.model.is_empty() {
            url.query_pairs_mut().append_pair("model", &self.model);
        }
        Ok(url)
    }
}

#[async_trait]
impl RealtimeConnector for WebsocketConnector {
    async fn connect(&self, call_id: &str, token: CancellationToken) -> Result<RealtimeLink> {
        if self.api_key.is_empty() {
            return Err(GatewayError::Configuration("realtime api key is not set".into()).into());
        }
        let endpoint = self.endpoint()?;
        let mut request = endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        debug!(call_id, url = %endpoint, "connecting realtime websocket");
        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                return Err(GatewayError::from_connect_error(
                    Some(status),
                    &format!("handshake rejected with {}", status),
                )
                .into());
            }
            Err(e) => {
                return Err(GatewayError::from_connect_error(None, &e.to_string()).into());
            }
        };
        info!(call_id, "realtime websocket connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let call_id = call_id.to_string();

        tokio::spawn(async move {
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        ws_sender.send(Message::Close(None)).await.ok();
                        break;
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(text) => {
                                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                    warn!(call_id, "realtime send failed: {}", e);
                                    inbound_tx.send(LinkMessage::Error(e.to_string())).ok();
                                    break;
                                }
                            }
                            None => {
                                ws_sender.send(Message::Close(None)).await.ok();
                                break;
                            }
                        }
                    }
                    incoming = ws_receiver.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(LinkMessage::Text(text.to_string())).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = match frame {
                                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                                    None => (None, String::new()),
                                };
                                info!(call_id, ?code, reason, "realtime websocket closed");
                                inbound_tx.send(LinkMessage::Closed { code, reason }).ok();
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(call_id, "realtime websocket error: {}", e);
                                inbound_tx.send(LinkMessage::Error(e.to_string())).ok();
                                break;
                            }
                            None => {
                                inbound_tx
                                    .send(LinkMessage::Closed { code: None, reason: "stream ended".into() })
                                    .ok();
                                break;
                            }
                        }
                    }
                }
            }
            debug!(call_id, "realtime websocket pump finished");
        });

        Ok(RealtimeLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// The backend side of an in-memory link.
pub struct MemoryPeer {
    pub call_id: String,
    pub to_client: mpsc::UnboundedSender<LinkMessage>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.to_client
            .send(LinkMessage::Text(value.to_string()))
            .is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(LinkMessage::Closed {
                code: Some(code),
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Next message the client sent, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

/// Connector that hands each new link's backend side to the holder of
/// the peer receiver. Used to drive sessions without a network.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                refuse: AtomicBool::new(false),
                attempts: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Make subsequent connects fail with a connectivity error.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl RealtimeConnector for MemoryConnector {
    async fn connect(&self, call_id: &str, _token: CancellationToken) -> Result<RealtimeLink> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Connectivity("connection refused".into()).into());
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                call_id: call_id.to_string(),
                to_client: inbound_tx,
                from_client: outbound_rx,
            })
            .map_err(|_| GatewayError::Connectivity("memory backend is gone".into()))?;
        Ok(RealtimeLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_model() {
        let config = RealtimeConfig {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let connector = WebsocketConnector::new(&config);
        let url = connector.endpoint().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "model" && v == config.model));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_configuration_error() {
        let config = RealtimeConfig {
            api_key: None,
            ..Default::default()
        };
        let connector = WebsocketConnector::new(&config);
        let err = connector
            .connect("c1", CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_connector_pairs_link() -> Result<()> {
        let (connector, mut peers) = MemoryConnector::new();
        let mut link = connector.connect("c1", CancellationToken::new()).await?;
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.call_id, "c1");

        link.outbound.send(r#"{"type":"input_audio_buffer.commit"}"#.to_string())?;
        let value = peer.recv_json().await.unwrap();
        assert_eq!(value["type"], "input_audio_buffer.commit");

        peer.close(1006, "gone");
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkMessage::Closed {
                code: Some(1006),
                reason: "gone".to_string()
            })
        );

        connector.set_refuse(true);
        assert!(connector.connect("c1", CancellationToken::new()).await.is_err());
        assert_eq!(connector.attempts().len(), 2);
        Ok(())
    }
}
