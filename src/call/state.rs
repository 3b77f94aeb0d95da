use super::params::CallParams;
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    New,
    Answered,
    PendingMedia,
    PipelineActive,
    Failed,
    Cleanup,
}

impl CallState {
    pub fn can_transition(self, to: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, to),
            (New, Answered)
                | (Answered, PendingMedia)
                | (PendingMedia, PipelineActive)
                | (New | Answered | PendingMedia | PipelineActive, Failed)
                | (New | Answered | PendingMedia | PipelineActive | Failed, Cleanup)
        )
    }

    /// Whether setup may still attach resources to the call.
    pub fn is_live(self) -> bool {
        !matches!(self, CallState::Failed | CallState::Cleanup)
    }
}

/// Everything the gateway holds for one call. Each resource is recorded
/// as soon as it exists so cleanup can find it.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub params: CallParams,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub pipeline_active_at: Option<DateTime<Utc>>,
    pub read_port: Option<u16>,
    pub write_port: Option<u16>,
    pub main_bridge: Option<String>,
    pub tap_bridge: Option<String>,
    pub snoop_channel: Option<String>,
    pub tap_media_channel: Option<String>,
    pub write_channel: Option<String>,
    pub read_stream_ready: bool,
    pub write_stream_ready: bool,
    pub recording: Option<String>,
    pub failure: Option<String>,
    pub token: CancellationToken,
}

impl CallRecord {
    pub fn new(params: CallParams, token: CancellationToken) -> Self {
        Self {
            params,
            state: CallState::New,
            created_at: Utc::now(),
            pipeline_active_at: None,
            read_port: None,
            write_port: None,
            main_bridge: None,
            tap_bridge: None,
            snoop_channel: None,
            tap_media_channel: None,
            write_channel: None,
            read_stream_ready: false,
            write_stream_ready: false,
            recording: None,
            failure: None,
            token,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.params.call_id
    }

    pub fn transition(&mut self, to: CallState) -> Result<(), GatewayError> {
        if !self.state.can_transition(to) {
            return Err(GatewayError::InvalidParams(format!(
                "call {} cannot move from {:?} to {:?}",
                self.params.call_id, self.state, to
            )));
        }
        self.state = to;
        if to == CallState::PipelineActive {
            self.pipeline_active_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Promote to `PipelineActive` once both legs are ready. Returns true
    /// only for the call that performed the promotion.
    pub fn try_activate(&mut self) -> bool {
        if self.state == CallState::PendingMedia
            && self.read_stream_ready
            && self.write_stream_ready
        {
            self.state = CallState::PipelineActive;
            self.pipeline_active_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// Auxiliary channel ids, in hangup order.
    pub fn aux_channels(&self) -> Vec<String> {
        [
            &self.snoop_channel,
            &self.tap_media_channel,
            &self.write_channel,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            call_id: self.params.call_id.clone(),
            state: self.state,
            caller: self.params.caller.clone(),
            extension: self.params.extension.clone(),
            created_at: self.created_at,
            pipeline_active_at: self.pipeline_active_at,
            read_port: self.read_port,
            write_port: self.write_port,
            read_stream_ready: self.read_stream_ready,
            write_stream_ready: self.write_stream_ready,
            recording: self.recording.clone(),
            failure: self.failure.clone(),
        }
    }
}

/// Serializable snapshot of a call.
#[derive(Debug, Clone, Serialize)]
pub struct CallStatus {
    pub call_id: String,
    pub state: CallState,
    pub caller: Option<String>,
    pub extension: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pipeline_active_at: Option<DateTime<Utc>>,
    pub read_port: Option<u16>,
    pub write_port: Option<u16>,
    pub read_stream_ready: bool,
    pub write_stream_ready: bool,
    pub recording: Option<String>,
    pub failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::new(
            CallParams {
                call_id: "c1".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_transitions() {
        let mut call = record();
        assert!(call.transition(CallState::PipelineActive).is_err());
        call.transition(CallState::Answered).unwrap();
        call.transition(CallState::PendingMedia).unwrap();
        assert!(call.transition(CallState::Answered).is_err());
        call.transition(CallState::Failed).unwrap();
        assert!(call.transition(CallState::PipelineActive).is_err());
        call.transition(CallState::Cleanup).unwrap();
        assert!(call.transition(CallState::Cleanup).is_err());
        assert!(!call.state.is_live());
    }

    #[test]
    fn test_activation_needs_both_legs_in_any_order() {
        for read_first in [true, false] {
            let mut call = record();
            call.transition(CallState::Answered).unwrap();
            call.transition(CallState::PendingMedia).unwrap();
            if read_first {
                call.read_stream_ready = true;
            } else {
                call.write_stream_ready = true;
            }
            assert!(!call.try_activate());
            call.read_stream_ready = true;
            call.write_stream_ready = true;
            assert!(call.try_activate());
            assert!(!call.try_activate());
            assert_eq!(call.state, CallState::PipelineActive);
            assert!(call.pipeline_active_at.is_some());
        }
    }

    #[test]
    fn test_legs_ready_before_pending_media() {
        let mut call = record();
        call.transition(CallState::Answered).unwrap();
        call.read_stream_ready = true;
        call.write_stream_ready = true;
        assert!(!call.try_activate());
        call.transition(CallState::PendingMedia).unwrap();
        assert!(call.try_activate());
    }

    #[test]
    fn test_aux_channel_order() {
        let mut call = record();
        call.write_channel = Some("w".to_string());
        call.snoop_channel = Some("s".to_string());
        assert_eq!(call.aux_channels(), vec!["s".to_string(), "w".to_string()]);
    }
}
