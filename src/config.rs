use crate::media::codecs::CodecType;
use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_APP_NAME: &str = "voicebridge";
const DEFAULT_PROMPT: &str = "You are a friendly phone assistant. Keep answers short and conversational, \
and let the caller interrupt you at any time.";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Directory for conversation transcripts; in-memory when unset.
    pub conversation_path: Option<String>,
    pub ari: AriConfig,
    pub rtp: RtpConfig,
    pub sender: SenderConfig,
    pub realtime: RealtimeConfig,
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AriConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub app: String,
    pub request_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RtpConfig {
    pub bind_ip: String,
    /// Address the switch is told to send RTP to.
    pub advertise_ip: String,
    pub start_port: u16,
    pub end_port: u16,
    pub codec: CodecType,
    pub lease_stale_secs: u64,
    pub health_check_interval_secs: u64,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SenderConfig {
    pub frame_ms: u32,
    pub target_frames: usize,
    pub min_frames: usize,
    pub max_frames: usize,
    /// Consecutive starved ticks before the target grows by one frame.
    pub underrun_adapt_after: u32,
    /// Consecutive over-max pushes before excess is dropped and the target shrinks.
    pub overflow_adapt_after: u32,
    /// Partial-frame ticks after which the tail is padded with silence and sent.
    pub tail_flush_ticks: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub transcription_model: Option<String>,
    pub instructions: String,
    /// Sent as a response request once the pipeline becomes active.
    pub greeting: Option<String>,
    pub handshake_timeout_ms: u64,
    pub min_commit_ms: u64,
    pub commit_safety_margin_ms: u64,
    pub fast_commit_chunks: u32,
    pub fast_commit_delay_ms: u64,
    pub commit_delay_ms: u64,
    /// Mean amplitude above which a chunk counts as speech.
    pub speech_amplitude: u32,
    pub max_pending_audio_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Close codes at or above this are application errors and never retried.
    pub close_code_threshold: u16,
    pub buffer_error_threshold: u32,
    pub transcript_stale_ms: u64,
    pub transcript_sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub media_setup_timeout_ms: u64,
    pub record: bool,
    pub record_format: String,
    pub cleanup_step_timeout_ms: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl Default for AriConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8088".to_string(),
            username: None,
            password: None,
            app: DEFAULT_APP_NAME.to_string(),
            request_timeout_ms: 5000,
            reconnect_interval_ms: 3000,
        }
    }
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            start_port: 20000,
            end_port: 20998,
            codec: CodecType::PCMU,
            lease_stale_secs: 3600,
            health_check_interval_secs: 60,
            stats_interval_secs: 10,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            target_frames: 4,
            min_frames: 2,
            max_frames: 8,
            underrun_adapt_after: 3,
            overflow_adapt_after: 3,
            tail_flush_ticks: 5,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            api_key: None,
            voice: "alloy".to_string(),
            transcription_model: Some("whisper-1".to_string()),
            instructions: DEFAULT_PROMPT.to_string(),
            greeting: Some("Greet the caller briefly and ask how you can help.".to_string()),
            handshake_timeout_ms: 10_000,
            min_commit_ms: 50,
            commit_safety_margin_ms: 10,
            fast_commit_chunks: 3,
            fast_commit_delay_ms: 5,
            commit_delay_ms: 300,
            speech_amplitude: 500,
            max_pending_audio_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 10_000,
            reconnect_max_attempts: 5,
            close_code_threshold: 4000,
            buffer_error_threshold: 3,
            transcript_stale_ms: 5000,
            transcript_sweep_interval_ms: 1000,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            media_setup_timeout_ms: 15_000,
            record: false,
            record_format: "wav".to_string(),
            cleanup_step_timeout_ms: 3000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            conversation_path: None,
            ari: AriConfig::default(),
            rtp: RtpConfig::default(),
            sender: SenderConfig::default(),
            realtime: RealtimeConfig::default(),
            call: CallConfig::default(),
        }
    }
}

impl SenderConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

impl RealtimeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let mut config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.apply_env();
        Ok(config)
    }

    /// Fill secrets that were left out of the file from the environment.
    pub fn apply_env(&mut self) {
        if self.realtime.api_key.is_none() {
            self.realtime.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if self.ari.username.is_none() {
            self.ari.username = std::env::var("ARI_USERNAME").ok();
        }
        if self.ari.password.is_none() {
            self.ari.password = std::env::var("ARI_PASSWORD").ok();
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let mut issue = |field: &str, message: String| {
            issues.push(ConfigIssue {
                field: field.to_string(),
                message,
            })
        };

        if self.rtp.start_port >= self.rtp.end_port {
            issue(
                "rtp.start_port",
                format!(
                    "start_port {} must be below end_port {}",
                    self.rtp.start_port, self.rtp.end_port
                ),
            );
        }
        if self.rtp.start_port % 2 != 0 {
            issue(
                "rtp.start_port",
                format!("start_port {} must be even", self.rtp.start_port),
            );
        }
        if self.rtp.start_port == 0 {
            issue("rtp.start_port", "port 0 is not a valid RTP port".to_string());
        }
        if self.rtp.advertise_ip.parse::<std::net::IpAddr>().is_err() {
            issue(
                "rtp.advertise_ip",
                format!("{} is not an IP address", self.rtp.advertise_ip),
            );
        }
        if self.rtp.bind_ip.parse::<std::net::IpAddr>().is_err() {
            issue(
                "rtp.bind_ip",
                format!("{} is not an IP address", self.rtp.bind_ip),
            );
        }

        let s = &self.sender;
        if s.frame_ms == 0 {
            issue("sender.frame_ms", "frame duration must be positive".to_string());
        }
        if !(s.min_frames >= 1 && s.min_frames <= s.target_frames && s.target_frames <= s.max_frames)
        {
            issue(
                "sender.target_frames",
                format!(
                    "expected 1 <= min ({}) <= target ({}) <= max ({})",
                    s.min_frames, s.target_frames, s.max_frames
                ),
            );
        }

        let r = &self.realtime;
        if r.reconnect_base_ms == 0 || r.reconnect_base_ms > r.reconnect_max_ms {
            issue(
                "realtime.reconnect_base_ms",
                format!(
                    "base delay {} ms must be positive and not exceed max {} ms",
                    r.reconnect_base_ms, r.reconnect_max_ms
                ),
            );
        }
        if r.buffer_error_threshold == 0 {
            issue(
                "realtime.buffer_error_threshold",
                "threshold must be at least 1".to_string(),
            );
        }
        if url::Url::parse(&r.url).is_err() {
            issue("realtime.url", format!("{} is not a valid URL", r.url));
        }
        if url::Url::parse(&self.ari.url).is_err() {
            issue("ari.url", format!("{} is not a valid URL", self.ari.url));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}
