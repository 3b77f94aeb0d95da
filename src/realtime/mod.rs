use crate::{
    config::RealtimeConfig, conversation::ConversationStore, event::EventSender,
    media::listener::AudioSink,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backoff;
pub mod commit;
pub mod connection;
pub mod protocol;
pub mod session;
pub mod transcript;
#[cfg(test)]
mod tests;

pub use connection::{
    LinkMessage, MemoryConnector, MemoryPeer, RealtimeConnector, RealtimeLink, WebsocketConnector,
};
pub use session::{SessionOptions, SessionShared, SessionState, SessionStats};
use session::{persist_transcripts, SessionCommand, SessionWorker};

const CLOSE_WAIT: Duration = Duration::from_secs(5);

struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<SessionShared>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one backend session per call.
pub struct RealtimeManager {
    config: RealtimeConfig,
    connector: Arc<dyn RealtimeConnector>,
    store: Arc<dyn ConversationStore>,
    events: EventSender,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl RealtimeManager {
    pub fn new(
        config: RealtimeConfig,
        connector: Arc<dyn RealtimeConnector>,
        store: Arc<dyn ConversationStore>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the backend session for a call. Audio sent before the
    /// handshake completes is buffered and flushed in order once ready.
    pub fn initialize_session(
        &self,
        options: SessionOptions,
        parent: &CancellationToken,
    ) -> Result<()> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&options.call_id) {
            return Err(anyhow!(
                "realtime session already exists for {}",
                options.call_id
            ));
        }
        let call_id = options.call_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = parent.child_token();
        let shared = Arc::new(SessionShared::default());
        let worker = SessionWorker::new(
            options,
            self.config.clone(),
            self.connector.clone(),
            self.store.clone(),
            self.events.clone(),
            shared.clone(),
            rx,
            token.clone(),
        );
        let task = tokio::spawn(worker.run());
        sessions.insert(
            call_id.clone(),
            SessionHandle {
                commands: tx,
                shared,
                token,
                task,
            },
        );
        debug!(call_id, "realtime session registered");
        Ok(())
    }

    pub fn has_session(&self, call_id: &str) -> bool {
        self.sessions().contains_key(call_id)
    }

    pub fn send_audio(&self, call_id: &str, payload: Bytes) -> bool {
        match self.sessions().get(call_id) {
            Some(handle) => handle
                .commands
                .send(SessionCommand::Audio(payload))
                .is_ok(),
            None => false,
        }
    }

    /// Ask the backend to generate a response, with optional per-response
    /// instructions (used for the greeting).
    pub fn request_response(&self, call_id: &str, instructions: Option<String>) -> bool {
        match self.sessions().get(call_id) {
            Some(handle) => handle
                .commands
                .send(SessionCommand::RequestResponse(instructions))
                .is_ok(),
            None => false,
        }
    }

    /// Close the session and wait for its transcripts to be written.
    pub async fn close_session(&self, call_id: &str) -> bool {
        let handle = self.sessions().remove(call_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.commands.send(SessionCommand::Close).ok();
        let mut task = handle.task;
        match tokio::time::timeout(CLOSE_WAIT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(call_id, "realtime session task failed: {}", e),
            Err(_) => {
                warn!(call_id, "realtime session did not close in time, cancelling");
                handle.token.cancel();
                task.abort();
            }
        }
        info!(call_id, "realtime session closed");
        true
    }

    pub fn session_stats(&self, call_id: &str) -> Option<SessionStats> {
        self.sessions().get(call_id).map(|h| h.shared.stats())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    /// Flush transcripts that have been idle beyond the staleness window.
    pub async fn sweep_transcripts(&self) -> usize {
        let threshold = Duration::from_millis(self.config.transcript_stale_ms);
        let now = Instant::now();
        let stale: Vec<_> = self
            .sessions()
            .iter()
            .filter_map(|(call_id, handle)| {
                let items = handle
                    .shared
                    .transcripts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take_stale(now, threshold);
                (!items.is_empty()).then(|| (call_id.clone(), items))
            })
            .collect();

        let mut flushed = 0;
        for (call_id, items) in stale {
            flushed += items.len();
            debug!(call_id, count = items.len(), "flushing stale transcripts");
            persist_transcripts(&call_id, items, &self.store, &self.events).await;
        }
        flushed
    }

    pub fn spawn_transcript_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_millis(self.config.transcript_sweep_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_transcripts().await;
                    }
                }
            }
            debug!("transcript sweeper stopped");
        })
    }
}

impl AudioSink for RealtimeManager {
    fn deliver(&self, call_id: &str, payload: Bytes) {
        self.send_audio(call_id, payload);
    }
}
