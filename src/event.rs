use crate::conversation::Role;
use bytes::Bytes;
use serde::Serialize;

/// Diagnostics attached to audio coming back from the backend.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeltaMeta {
    pub response_id: Option<String>,
    pub bytes: usize,
    /// Time spent decoding the delta, in microseconds.
    pub decode_us: u64,
    pub received_at: u64,
}

/// SessionEvent represents what a realtime session reports to the call
/// orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Handshake finished; audio flows to the backend.
    Ready { call_id: String },

    /// Audio generated by the backend, ready for the RTP sender.
    AudioDelta {
        call_id: String,
        #[serde(skip)]
        payload: Bytes,
        meta: AudioDeltaMeta,
    },

    /// Caller started speaking; `during_response` marks a barge-in.
    SpeechStarted {
        call_id: String,
        during_response: bool,
    },

    /// A transcript was flushed to the conversation record.
    Transcript {
        call_id: String,
        role: Role,
        text: String,
    },

    Reconnecting {
        call_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    Reconnected { call_id: String, attempt: u32 },

    /// The session cannot continue; the call should be torn down.
    Failed { call_id: String, error: String },

    /// The backend closed the session normally.
    Closed { call_id: String },
}

impl SessionEvent {
    pub fn call_id(&self) -> &str {
        match self {
            SessionEvent::Ready { call_id }
            | SessionEvent::AudioDelta { call_id, .. }
            | SessionEvent::SpeechStarted { call_id, .. }
            | SessionEvent::Transcript { call_id, .. }
            | SessionEvent::Reconnecting { call_id, .. }
            | SessionEvent::Reconnected { call_id, .. }
            | SessionEvent::Failed { call_id, .. }
            | SessionEvent::Closed { call_id } => call_id,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::mpsc::UnboundedSender<SessionEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;
