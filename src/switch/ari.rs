use super::{MediaRole, RawCallParams, RtpEndpoint, SwitchControl, SwitchEvent};
use crate::{config::AriConfig, error::GatewayError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const RTP_ADDRESS_VAR: &str = "UNICASTRTP_LOCAL_ADDRESS";
const RTP_PORT_VAR: &str = "UNICASTRTP_LOCAL_PORT";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AriCaller {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AriDialplan {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AriChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub caller: Option<AriCaller>,
    #[serde(default)]
    pub dialplan: Option<AriDialplan>,
    #[serde(default)]
    pub channelvars: Option<HashMap<String, Value>>,
}

/// The subset of ARI events the gateway reacts to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        #[serde(default)]
        args: Vec<String>,
        channel: AriChannel,
    },
    StasisEnd {
        channel: AriChannel,
    },
    ChannelDestroyed {
        #[serde(default)]
        cause: Option<i64>,
        #[serde(default)]
        cause_txt: Option<String>,
        channel: AriChannel,
    },
    ChannelHangupRequest {
        channel: AriChannel,
    },
    #[serde(other)]
    Other,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl AriEvent {
    pub fn into_switch_event(self) -> Option<SwitchEvent> {
        match self {
            AriEvent::StasisStart { args, channel } => {
                if let [role, call_id, ..] = args.as_slice() {
                    if let Some(role) = MediaRole::parse(role) {
                        return Some(SwitchEvent::MediaChannelStarted {
                            channel_id: channel.id,
                            call_id: call_id.clone(),
                            role,
                        });
                    }
                }
                if let Some((role, call_id)) = MediaRole::from_channel_id(&channel.id) {
                    return Some(SwitchEvent::MediaChannelStarted {
                        channel_id: channel.id,
                        call_id,
                        role,
                    });
                }
                let variables = channel
                    .channelvars
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect();
                Some(SwitchEvent::CallStarted(RawCallParams {
                    channel_id: channel.id,
                    caller: channel.caller.and_then(|c| non_empty(&c.number)),
                    extension: channel.dialplan.and_then(|d| non_empty(&d.exten)),
                    args,
                    variables,
                }))
            }
            AriEvent::StasisEnd { channel } => Some(SwitchEvent::StasisEnded {
                channel_id: channel.id,
            }),
            AriEvent::ChannelDestroyed {
                cause,
                cause_txt,
                channel,
            } => Some(SwitchEvent::ChannelDestroyed {
                channel_id: channel.id,
                cause: cause_txt.or_else(|| cause.map(|c| c.to_string())),
            }),
            AriEvent::ChannelHangupRequest { channel } => Some(SwitchEvent::HangupRequested {
                channel_id: channel.id,
            }),
            AriEvent::Other => None,
        }
    }
}

/// Parse one ARI websocket message into a switch event.
pub fn parse_event(text: &str) -> Result<Option<SwitchEvent>> {
    let event: AriEvent = serde_json::from_str(text)?;
    Ok(event.into_switch_event())
}

/// REST client for the Asterisk REST Interface.
pub struct AriClient {
    base: Url,
    app: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl AriClient {
    pub fn new(config: &AriConfig) -> Result<Self> {
        let base = Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            base,
            app: config.app.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("ARI url {} cannot be a base", self.base))?
            .pop_if_empty()
            .push("ari")
            .extend(segments);
        Ok(url)
    }

    async fn request(
        &self,
        op: &str,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(segments)?;
        debug!(op, %url, "ARI request");
        let mut builder = self.client.request(method, url).query(query);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }
        builder
            .send()
            .await
            .map_err(|e| GatewayError::switch(op, e).into())
    }

    async fn checked(
        &self,
        op: &str,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        allow_missing: bool,
    ) -> Result<Option<reqwest::Response>> {
        let response = self.request(op, method, segments, query).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if allow_missing && status == StatusCode::NOT_FOUND {
            debug!(op, "ARI resource already gone");
            return Ok(None);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::switch(op, format!("{} {}", status.as_u16(), body.trim())).into())
    }

    async fn created_id(
        &self,
        op: &str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<String> {
        let response = self
            .checked(op, Method::POST, segments, query, false)
            .await?
            .ok_or_else(|| GatewayError::switch(op, "empty response"))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::switch(op, e))?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::switch(op, "response has no id").into())
    }

    async fn channel_variable(&self, channel_id: &str, name: &str) -> Result<String> {
        let op = "get_variable";
        let response = self
            .checked(
                op,
                Method::GET,
                &["channels", channel_id, "variable"],
                &[("variable", name)],
                false,
            )
            .await?
            .ok_or_else(|| GatewayError::switch(op, "empty response"))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::switch(op, e))?;
        body.get("value")
            .and_then(Value::as_str)
            .and_then(non_empty)
            .ok_or_else(|| GatewayError::switch(op, format!("{} is not set", name)).into())
    }
}

#[async_trait]
impl SwitchControl for AriClient {
    async fn answer(&self, channel_id: &str) -> Result<()> {
        self.checked(
            "answer",
            Method::POST,
            &["channels", channel_id, "answer"],
            &[],
            false,
        )
        .await?;
        Ok(())
    }

    async fn create_bridge(&self, name: &str) -> Result<String> {
        self.created_id(
            "create_bridge",
            &["bridges"],
            &[("type", "mixing"), ("name", name)],
        )
        .await
    }

    async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.checked(
            "add_channel_to_bridge",
            Method::POST,
            &["bridges", bridge_id, "addChannel"],
            &[("channel", channel_id)],
            false,
        )
        .await?;
        Ok(())
    }

    async fn create_snoop(
        &self,
        channel_id: &str,
        snoop_id: &str,
        app_args: &str,
    ) -> Result<String> {
        self.created_id(
            "create_snoop",
            &["channels", channel_id, "snoop"],
            &[
                ("spy", "in"),
                ("app", self.app.as_str()),
                ("appArgs", app_args),
                ("snoopId", snoop_id),
            ],
        )
        .await
    }

    async fn create_external_media(
        &self,
        channel_id: &str,
        external_host: &str,
        format: &str,
    ) -> Result<String> {
        self.created_id(
            "create_external_media",
            &["channels", "externalMedia"],
            &[
                ("channelId", channel_id),
                ("app", self.app.as_str()),
                ("external_host", external_host),
                ("format", format),
                ("encapsulation", "rtp"),
                ("transport", "udp"),
                ("direction", "both"),
            ],
        )
        .await
    }

    async fn local_rtp_endpoint(&self, channel_id: &str) -> Result<RtpEndpoint> {
        let host = self.channel_variable(channel_id, RTP_ADDRESS_VAR).await?;
        let port = self.channel_variable(channel_id, RTP_PORT_VAR).await?;
        let port = port
            .parse::<u16>()
            .map_err(|_| GatewayError::switch("get_variable", format!("bad RTP port {}", port)))?;
        Ok(RtpEndpoint { host, port })
    }

    async fn record_bridge(&self, bridge_id: &str, name: &str, format: &str) -> Result<()> {
        self.checked(
            "record_bridge",
            Method::POST,
            &["bridges", bridge_id, "record"],
            &[("name", name), ("format", format), ("ifExists", "overwrite")],
            false,
        )
        .await?;
        Ok(())
    }

    async fn stop_recording(&self, name: &str) -> Result<()> {
        self.checked(
            "stop_recording",
            Method::POST,
            &["recordings", "live", name, "stop"],
            &[],
            true,
        )
        .await?;
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<()> {
        self.checked(
            "hangup",
            Method::DELETE,
            &["channels", channel_id],
            &[],
            true,
        )
        .await?;
        Ok(())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        self.checked(
            "destroy_bridge",
            Method::DELETE,
            &["bridges", bridge_id],
            &[],
            true,
        )
        .await?;
        Ok(())
    }
}

/// Subscription to the ARI event websocket for one Stasis application.
pub struct AriEventStream {
    config: AriConfig,
}

impl AriEventStream {
    pub fn new(config: AriConfig) -> Self {
        Self { config }
    }

    pub fn events_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot use {} for the ARI websocket", self.config.url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("ARI url {} cannot be a base", self.config.url))?
            .pop_if_empty()
            .extend(["ari", "events"]);
        url.query_pairs_mut()
            .append_pair("app", &self.config.app)
            .append_pair("subscribeAll", "false");
        Ok(url)
    }

    /// Forward events until cancelled, reconnecting after a fixed delay.
    pub async fn run(
        &self,
        events: mpsc::UnboundedSender<SwitchEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        loop {
            match self.stream_once(&events, &token).await {
                Ok(()) => info!("ARI event stream closed"),
                Err(e) => warn!("ARI event stream error: {}", e),
            }
            if events.is_closed() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn stream_once(
        &self,
        events: &mpsc::UnboundedSender<SwitchEvent>,
        token: &CancellationToken,
    ) -> Result<()> {
        let url = self.events_url()?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(username) = &self.config.username {
            let credentials = format!(
                "{}:{}",
                username,
                self.config.password.as_deref().unwrap_or_default()
            );
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials)))?,
            );
        }
        let (mut ws_stream, _) = connect_async(request).await?;
        info!(app = self.config.app, "ARI event stream connected");

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                msg = ws_stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match parse_event(text.as_str()) {
                        Ok(Some(event)) => {
                            debug!(channel_id = event.channel_id(), "ARI event {:?}", event);
                            if events.send(event).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("unparsable ARI event: {} {}", e, text.as_str()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("ARI websocket closed: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_call_maps_to_call_started() {
        let text = r#"{
            "type": "StasisStart",
            "timestamp": "2024-05-01T10:00:00.000+0000",
            "args": ["carrier_id=abc123", "prompt=be brief"],
            "channel": {
                "id": "1714557600.17",
                "name": "PJSIP/trunk-00000011",
                "state": "Ring",
                "caller": {"name": "", "number": "+15550100"},
                "dialplan": {"context": "from-trunk", "exten": "100", "priority": 1},
                "channelvars": {"SIPCALLID": "abc123@carrier"}
            },
            "application": "voicebridge"
        }"#;
        match parse_event(text).unwrap() {
            Some(SwitchEvent::CallStarted(params)) => {
                assert_eq!(params.channel_id, "1714557600.17");
                assert_eq!(params.caller.as_deref(), Some("+15550100"));
                assert_eq!(params.extension.as_deref(), Some("100"));
                assert_eq!(params.args.len(), 2);
                assert_eq!(
                    params.variables.get("SIPCALLID").map(String::as_str),
                    Some("abc123@carrier")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gateway_channels_map_to_media_started() {
        let snoop = r#"{"type":"StasisStart","args":["tap","1714557600.17"],"channel":{"id":"1714557600.17-tap"}}"#;
        assert_eq!(
            parse_event(snoop).unwrap(),
            Some(SwitchEvent::MediaChannelStarted {
                channel_id: "1714557600.17-tap".to_string(),
                call_id: "1714557600.17".to_string(),
                role: MediaRole::Tap,
            })
        );

        let external = r#"{"type":"StasisStart","args":[],"channel":{"id":"1714557600.17-write","name":"UnicastRTP/127.0.0.1:20002-0x1"}}"#;
        assert_eq!(
            parse_event(external).unwrap(),
            Some(SwitchEvent::MediaChannelStarted {
                channel_id: "1714557600.17-write".to_string(),
                call_id: "1714557600.17".to_string(),
                role: MediaRole::Write,
            })
        );
    }

    #[test]
    fn test_teardown_events() {
        let destroyed = r#"{"type":"ChannelDestroyed","cause":16,"cause_txt":"Normal Clearing","channel":{"id":"c1"}}"#;
        assert_eq!(
            parse_event(destroyed).unwrap(),
            Some(SwitchEvent::ChannelDestroyed {
                channel_id: "c1".to_string(),
                cause: Some("Normal Clearing".to_string()),
            })
        );
        let hangup = r#"{"type":"ChannelHangupRequest","cause":16,"channel":{"id":"c1"}}"#;
        assert_eq!(
            parse_event(hangup).unwrap(),
            Some(SwitchEvent::HangupRequested {
                channel_id: "c1".to_string()
            })
        );
        let end = r#"{"type":"StasisEnd","channel":{"id":"c1"}}"#;
        assert_eq!(
            parse_event(end).unwrap(),
            Some(SwitchEvent::StasisEnded {
                channel_id: "c1".to_string()
            })
        );
        let other = r#"{"type":"ChannelVarset","variable":"X","value":"1"}"#;
        assert_eq!(parse_event(other).unwrap(), None);
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_urls() {
        let config = AriConfig {
            url: "http://pbx.local:8088/".to_string(),
            app: "bridge-app".to_string(),
            ..Default::default()
        };
        let client = AriClient::new(&config).unwrap();
        let url = client
            .endpoint(&["channels", "1714557600.17", "answer"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://pbx.local:8088/ari/channels/1714557600.17/answer"
        );

        let stream = AriEventStream::new(config);
        let url = stream.events_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ari/events");
        assert!(url.query_pairs().any(|(k, v)| k == "app" && v == "bridge-app"));
    }
}
