use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod ari;

pub use ari::{AriClient, AriEventStream};

/// Auxiliary channels the gateway creates for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRole {
    /// Spy channel copying the caller's audio.
    Tap,
    /// External media channel streaming the tap to our read-port.
    TapMedia,
    /// External media channel carrying our audio into the main bridge.
    Write,
}

impl MediaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaRole::Tap => "tap",
            MediaRole::TapMedia => "tapmedia",
            MediaRole::Write => "write",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tap" => Some(MediaRole::Tap),
            "tapmedia" => Some(MediaRole::TapMedia),
            "write" => Some(MediaRole::Write),
            _ => None,
        }
    }

    /// Stasis application arguments identifying the channel.
    pub fn app_args(&self, call_id: &str) -> String {
        format!("{},{}", self.as_str(), call_id)
    }

    /// Deterministic id for a channel created on behalf of a call. External
    /// media channels enter Stasis without arguments, so the id carries
    /// the role instead.
    pub fn channel_id(&self, call_id: &str) -> String {
        format!("{}-{}", call_id, self.as_str())
    }

    pub fn from_channel_id(channel_id: &str) -> Option<(Self, String)> {
        let (call_id, role) = channel_id.rsplit_once('-')?;
        if call_id.is_empty() {
            return None;
        }
        MediaRole::parse(role).map(|role| (role, call_id.to_string()))
    }
}

impl fmt::Display for MediaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a new call as delivered by the switch, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCallParams {
    pub channel_id: String,
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchEvent {
    CallStarted(RawCallParams),
    MediaChannelStarted {
        channel_id: String,
        call_id: String,
        role: MediaRole,
    },
    ChannelDestroyed {
        channel_id: String,
        cause: Option<String>,
    },
    HangupRequested {
        channel_id: String,
    },
    StasisEnded {
        channel_id: String,
    },
}

impl SwitchEvent {
    pub fn channel_id(&self) -> &str {
        match self {
            SwitchEvent::CallStarted(params) => &params.channel_id,
            SwitchEvent::MediaChannelStarted { channel_id, .. }
            | SwitchEvent::ChannelDestroyed { channel_id, .. }
            | SwitchEvent::HangupRequested { channel_id }
            | SwitchEvent::StasisEnded { channel_id } => channel_id,
        }
    }
}

/// Where the switch expects RTP for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtpEndpoint {
    pub host: String,
    pub port: u16,
}

/// Control-plane operations the orchestrator needs from the switch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwitchControl: Send + Sync {
    async fn answer(&self, channel_id: &str) -> Result<()>;

    /// Create a mixing bridge and return its id.
    async fn create_bridge(&self, name: &str) -> Result<String>;

    async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()>;

    /// Create a spy channel that copies the caller's inbound audio.
    async fn create_snoop(&self, channel_id: &str, snoop_id: &str, app_args: &str)
        -> Result<String>;

    /// Create an RTP external media channel talking to `external_host`.
    async fn create_external_media(
        &self,
        channel_id: &str,
        external_host: &str,
        format: &str,
    ) -> Result<String>;

    async fn local_rtp_endpoint(&self, channel_id: &str) -> Result<RtpEndpoint>;

    async fn record_bridge(&self, bridge_id: &str, name: &str, format: &str) -> Result<()>;

    async fn stop_recording(&self, name: &str) -> Result<()>;

    /// Hang up a channel. A channel that is already gone is not an error.
    async fn hangup(&self, channel_id: &str) -> Result<()>;

    /// Destroy a bridge. A bridge that is already gone is not an error.
    async fn destroy_bridge(&self, bridge_id: &str) -> Result<()>;
}
