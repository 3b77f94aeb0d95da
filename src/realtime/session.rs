use super::{
    backoff::Backoff,
    commit::{CommitDecision, CommitPolicy, CommitTracker},
    connection::{LinkMessage, RealtimeConnector, RealtimeLink},
    protocol::{
        ClientEvent, ErrorDetail, ResponseOptions, ServerEvent, SessionConfig,
        TranscriptionOptions, TurnDetection,
    },
    transcript::TranscriptAccumulator,
};
use crate::{
    config::RealtimeConfig,
    conversation::{ConversationStore, Role},
    error::GatewayError,
    event::{AudioDeltaMeta, EventSender, SessionEvent},
    media::codecs::CodecType,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call parameters for a backend session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub call_id: String,
    pub instructions: String,
    pub voice: String,
    pub codec: CodecType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Initializing,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    Closed,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub commits: u64,
    pub responses_requested: u64,
    pub audio_deltas: u64,
    pub audio_bytes_received: u64,
    pub buffer_errors: u64,
    pub reconnects: u32,
    pub pending_chunks: usize,
    pub dropped_pending_chunks: u64,
}

/// State the manager can observe while the worker runs.
#[derive(Default)]
pub struct SessionShared {
    pub(crate) stats: Mutex<SessionStats>,
    pub(crate) transcripts: Mutex<TranscriptAccumulator>,
}

impl SessionShared {
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    fn set_state(&self, state: SessionState) {
        self.update(|s| s.state = state);
    }

    fn transcripts(&self) -> std::sync::MutexGuard<'_, TranscriptAccumulator> {
        self.transcripts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Audio(Bytes),
    RequestResponse(Option<String>),
    Close,
}

/// How one connection ended.
enum LinkOutcome {
    /// Closed by us or normally by the backend.
    Closed { by_backend: bool },
    Cancelled,
    Reconnect(GatewayError),
    Fatal(GatewayError),
}

pub(crate) async fn persist_transcripts(
    call_id: &str,
    items: Vec<(Role, String)>,
    store: &Arc<dyn ConversationStore>,
    events: &EventSender,
) {
    for (role, text) in items {
        if let Err(e) = store.append_message(call_id, role, &text).await {
            warn!(call_id, "failed to persist transcript: {}", e);
        }
        events
            .send(SessionEvent::Transcript {
                call_id: call_id.to_string(),
                role,
                text,
            })
            .ok();
    }
}

pub(crate) struct SessionWorker {
    options: SessionOptions,
    config: RealtimeConfig,
    connector: Arc<dyn RealtimeConnector>,
    store: Arc<dyn ConversationStore>,
    events: EventSender,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    token: CancellationToken,
    tracker: CommitTracker,
    backoff: Backoff,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    pending_response: Option<Option<String>>,
    /// Speech-like audio buffered while the link was down.
    outage_speech_bytes: usize,
    reconnect_attempt: Option<u32>,
    ready: bool,
    announced: bool,
    response_active: bool,
    caller_speaking: bool,
    buffer_errors: u32,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: SessionOptions,
        config: RealtimeConfig,
        connector: Arc<dyn RealtimeConnector>,
        store: Arc<dyn ConversationStore>,
        events: EventSender,
        shared: Arc<SessionShared>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        token: CancellationToken,
    ) -> Self {
        let policy = CommitPolicy::from_config(&config, options.codec.bytes_per_ms());
        let backoff = Backoff::from_config(&config);
        Self {
            options,
            config,
            connector,
            store,
            events,
            shared,
            commands,
            token,
            tracker: CommitTracker::new(policy),
            backoff,
            outbound: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            pending_response: None,
            outage_speech_bytes: 0,
            reconnect_attempt: None,
            ready: false,
            announced: false,
            response_active: false,
            caller_speaking: false,
            buffer_errors: 0,
        }
    }

    fn call_id(&self) -> &str {
        &self.options.call_id
    }

    fn emit(&self, event: SessionEvent) {
        self.events.send(event).ok();
    }

    pub(crate) async fn run(mut self) {
        let call_id = self.options.call_id.clone();
        info!(call_id, "realtime session starting");
        loop {
            self.shared.set_state(SessionState::Connecting);
            let link = tokio::select! {
                _ = self.token.cancelled() => break,
                link = self.connector.connect(&call_id, self.token.child_token()) => link,
            };
            let outcome = match link {
                Ok(link) => {
                    self.shared.set_state(SessionState::Connected);
                    self.drive(link).await
                }
                Err(e) => {
                    let err = match e.downcast::<GatewayError>() {
                        Ok(err) => err,
                        Err(e) => GatewayError::Connectivity(e.to_string()),
                    };
                    warn!(call_id, "realtime connect failed: {}", err);
                    if err.is_fatal() {
                        LinkOutcome::Fatal(err)
                    } else {
                        LinkOutcome::Reconnect(err)
                    }
                }
            };
            self.outbound = None;
            match outcome {
                LinkOutcome::Closed { by_backend } => {
                    if by_backend {
                        self.emit(SessionEvent::Closed {
                            call_id: call_id.clone(),
                        });
                    }
                    break;
                }
                LinkOutcome::Cancelled => break,
                LinkOutcome::Fatal(err) => {
                    warn!(call_id, "realtime session failed: {}", err);
                    self.shared.set_state(SessionState::Error);
                    self.emit(SessionEvent::Failed {
                        call_id: call_id.clone(),
                        error: err.to_string(),
                    });
                    self.finish(SessionState::Error).await;
                    return;
                }
                LinkOutcome::Reconnect(reason) => {
                    if !self.wait_reconnect(reason).await {
                        break;
                    }
                }
            }
        }
        self.finish(SessionState::Closed).await;
    }

    async fn finish(&mut self, state: SessionState) {
        let items = self.shared.transcripts().take_all();
        persist_transcripts(self.call_id(), items, &self.store, &self.events).await;
        self.shared.update(|s| {
            if s.state != SessionState::Error {
                s.state = state;
            }
        });
        let stats = self.shared.stats();
        info!(
            call_id = self.call_id(),
            commits = stats.commits,
            chunks = stats.chunks_sent,
            deltas = stats.audio_deltas,
            reconnects = stats.reconnects,
            "realtime session finished"
        );
    }

    /// Sleep out the backoff delay while still buffering caller audio.
    /// Returns false when the session should stop.
    async fn wait_reconnect(&mut self, reason: GatewayError) -> bool {
        self.ready = false;
        self.response_active = false;
        self.caller_speaking = false;
        self.tracker.reset();
        if matches!(reason, GatewayError::HandshakeTimeout(_)) {
            self.shared.set_state(SessionState::Timeout);
        } else {
            self.shared.set_state(SessionState::Reconnecting);
        }

        let Some(delay) = self.backoff.next_delay() else {
            let attempts = self.backoff.attempt();
            warn!(call_id = self.call_id(), attempts, "realtime reconnect budget exhausted");
            self.shared.set_state(SessionState::Error);
            self.emit(SessionEvent::Failed {
                call_id: self.options.call_id.clone(),
                error: format!("reconnect failed after {} attempts: {}", attempts, reason),
            });
            return false;
        };
        let attempt = self.backoff.attempt();
        self.reconnect_attempt = Some(attempt);
        self.shared.update(|s| s.reconnects += 1);
        info!(
            call_id = self.call_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "realtime reconnect scheduled"
        );
        self.emit(SessionEvent::Reconnecting {
            call_id: self.options.call_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.token.cancelled() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Audio(chunk)) => self.buffer_pending(chunk),
                    Some(SessionCommand::RequestResponse(instructions)) => {
                        self.pending_response = Some(instructions);
                    }
                    Some(SessionCommand::Close) | None => return false,
                },
            }
        }
    }

    async fn drive(&mut self, link: RealtimeLink) -> LinkOutcome {
        let RealtimeLink {
            outbound,
            mut inbound,
        } = link;
        self.outbound = Some(outbound);
        let token = self.token.clone();
        let handshake_timeout = self.config.handshake_timeout();
        let handshake = tokio::time::sleep(handshake_timeout);
        tokio::pin!(handshake);

        loop {
            let commit_deadline = self.tracker.deadline();
            let commit_at = commit_deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = token.cancelled() => return LinkOutcome::Cancelled,
                msg = inbound.recv() => {
                    let outcome = match msg {
                        Some(LinkMessage::Text(text)) => self.on_server_text(&text).await,
                        Some(LinkMessage::Closed { code, reason }) => Some(self.classify_close(code, &reason)),
                        Some(LinkMessage::Error(e)) => Some(LinkOutcome::Reconnect(GatewayError::Connectivity(e))),
                        None => Some(LinkOutcome::Reconnect(GatewayError::Connectivity("link dropped".into()))),
                    };
                    if let Some(outcome) = outcome {
                        return outcome;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Audio(chunk)) => self.on_audio(chunk),
                    Some(SessionCommand::RequestResponse(instructions)) => {
                        if self.ready {
                            self.send_response(instructions);
                        } else {
                            self.pending_response = Some(instructions);
                        }
                    }
                    Some(SessionCommand::Close) | None => return LinkOutcome::Closed { by_backend: false },
                },
                _ = tokio::time::sleep_until(commit_at), if commit_deadline.is_some() => {
                    if self.tracker.on_deadline(Instant::now()) {
                        self.send_commit();
                    }
                }
                _ = &mut handshake, if !self.ready => {
                    warn!(call_id = self.call_id(), "realtime handshake timed out");
                    return LinkOutcome::Reconnect(GatewayError::HandshakeTimeout(
                        handshake_timeout.as_millis() as u64,
                    ));
                }
            }
        }
    }

    fn classify_close(&self, code: Option<u16>, reason: &str) -> LinkOutcome {
        match code {
            Some(1000) => {
                info!(call_id = self.call_id(), reason, "realtime session closed normally");
                LinkOutcome::Closed { by_backend: true }
            }
            Some(code) if code >= self.config.close_code_threshold => {
                LinkOutcome::Fatal(GatewayError::Connectivity(format!(
                    "backend closed with code {}: {}",
                    code, reason
                )))
            }
            Some(code) => LinkOutcome::Reconnect(GatewayError::Connectivity(format!(
                "abnormal close {}: {}",
                code, reason
            ))),
            None => LinkOutcome::Reconnect(GatewayError::Connectivity(format!(
                "closed without code: {}",
                reason
            ))),
        }
    }

    fn send(&self, event: ClientEvent) -> bool {
        match &self.outbound {
            Some(outbound) => {
                let kind = event.kind();
                if outbound.send(event.to_json()).is_err() {
                    debug!(call_id = self.call_id(), kind, "realtime link gone, message dropped");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    fn is_speech(&self, chunk: &[u8]) -> bool {
        self.options.codec.mean_amplitude(chunk) >= self.config.speech_amplitude
    }

    fn buffer_pending(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        if self.reconnect_attempt.is_some() && self.is_speech(&chunk) {
            self.outage_speech_bytes += chunk.len();
        }
        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);

        let cap = self.config.max_pending_audio_ms as usize * self.options.codec.bytes_per_ms();
        let mut dropped = 0u64;
        while self.pending_bytes > cap && self.pending.len() > 1 {
            if let Some(old) = self.pending.pop_front() {
                self.pending_bytes -= old.len();
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(call_id = self.call_id(), dropped, "pending audio over limit, oldest dropped");
        }
        let pending = self.pending.len();
        self.shared.update(|s| {
            s.pending_chunks = pending;
            s.dropped_pending_chunks += dropped;
        });
    }

    fn on_audio(&mut self, chunk: Bytes) {
        if !self.ready {
            self.buffer_pending(chunk);
            return;
        }
        self.append(chunk);
    }

    fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let len = chunk.len();
        let barge_in = self.response_active && self.caller_speaking && self.is_speech(&chunk);
        if !self.send(ClientEvent::InputAudioBufferAppend {
            audio: STANDARD.encode(&chunk),
        }) {
            return;
        }
        self.shared.update(|s| {
            s.chunks_sent += 1;
            s.bytes_sent += len as u64;
        });
        if self.tracker.on_append(len, Instant::now(), barge_in) == CommitDecision::Now {
            debug!(call_id = self.call_id(), "barge-in, committing immediately");
            self.send_commit();
        }
    }

    fn send_commit(&mut self) -> bool {
        if !self.tracker.can_commit() {
            return false;
        }
        let buffered_ms = self.tracker.buffered().as_millis() as u64;
        if !self.send(ClientEvent::InputAudioBufferCommit) {
            return false;
        }
        self.tracker.mark_committed(Instant::now());
        self.shared.update(|s| s.commits += 1);
        debug!(call_id = self.call_id(), buffered_ms, "audio committed");
        true
    }

    fn send_response(&mut self, instructions: Option<String>) {
        let response = instructions.map(|instructions| ResponseOptions {
            instructions: Some(instructions),
        });
        if self.send(ClientEvent::ResponseCreate { response }) {
            self.shared.update(|s| s.responses_requested += 1);
        }
    }

    fn session_config(&self) -> SessionConfig {
        let format = self.options.codec.realtime_format().to_string();
        SessionConfig {
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions: self.options.instructions.clone(),
            voice: self.options.voice.clone(),
            input_audio_format: format.clone(),
            output_audio_format: format,
            input_audio_transcription: self
                .config
                .transcription_model
                .as_ref()
                .map(|model| TranscriptionOptions {
                    model: model.clone(),
                }),
            turn_detection: Some(TurnDetection {
                kind: "server_vad".to_string(),
                silence_duration_ms: None,
            }),
        }
    }

    fn on_session_ready(&mut self) {
        self.ready = true;
        self.buffer_errors = 0;
        self.shared.set_state(SessionState::Ready);

        let pending: Vec<Bytes> = self.pending.drain(..).collect();
        let flushed = pending.len();
        self.pending_bytes = 0;
        self.shared.update(|s| s.pending_chunks = 0);
        for chunk in pending {
            self.append(chunk);
        }

        let call_id = self.options.call_id.clone();
        if !self.announced {
            self.announced = true;
            info!(call_id, flushed, "realtime session ready");
            self.emit(SessionEvent::Ready {
                call_id: call_id.clone(),
            });
        }
        if let Some(attempt) = self.reconnect_attempt.take() {
            info!(call_id, attempt, flushed, "realtime session restored");
            self.backoff.reset();
            self.emit(SessionEvent::Reconnected { call_id, attempt });
            let speech_ms =
                (self.outage_speech_bytes / self.options.codec.bytes_per_ms().max(1)) as u64;
            self.outage_speech_bytes = 0;
            let enough =
                speech_ms >= self.config.min_commit_ms + self.config.commit_safety_margin_ms;
            if enough && self.send_commit() && self.pending_response.is_none() {
                self.send_response(None);
            }
        }
        if let Some(instructions) = self.pending_response.take() {
            self.send_response(instructions);
        }
    }

    async fn flush_transcript(&mut self, role: Role) {
        let text = self.shared.transcripts().take(role);
        if let Some(text) = text {
            persist_transcripts(self.call_id(), vec![(role, text)], &self.store, &self.events).await;
        }
    }

    fn on_error(&mut self, error: ErrorDetail) -> Option<LinkOutcome> {
        let err = GatewayError::from_backend(
            error.code.as_deref(),
            error.kind.as_deref(),
            &error.message,
        );
        match err {
            GatewayError::ProtocolDesync(_) => {
                self.buffer_errors += 1;
                self.tracker.reset();
                self.shared.update(|s| s.buffer_errors += 1);
                warn!(
                    call_id = self.call_id(),
                    count = self.buffer_errors,
                    "backend rejected commit, local audio counters reset"
                );
                if self.buffer_errors >= self.config.buffer_error_threshold {
                    self.buffer_errors = 0;
                    return Some(LinkOutcome::Reconnect(err));
                }
                None
            }
            GatewayError::Authentication(_) => Some(LinkOutcome::Fatal(err)),
            GatewayError::RateLimited(_) => {
                warn!(call_id = self.call_id(), "backend rate limited: {}", error.message);
                Some(LinkOutcome::Reconnect(err))
            }
            _ => {
                warn!(
                    call_id = self.call_id(),
                    code = error.code.as_deref().unwrap_or_default(),
                    "backend error: {}",
                    error.message
                );
                None
            }
        }
    }

    async fn on_server_text(&mut self, text: &str) -> Option<LinkOutcome> {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(call_id = self.call_id(), "unparsable backend message: {}", e);
                return None;
            }
        };
        let now = Instant::now();
        match event {
            ServerEvent::SessionCreated { .. } => {
                debug!(call_id = self.call_id(), "session created, sending configuration");
                let session = self.session_config();
                self.send(ClientEvent::SessionUpdate { session });
            }
            ServerEvent::SessionUpdated { .. } => {
                if !self.ready {
                    self.on_session_ready();
                }
            }
            ServerEvent::SessionExpired => {
                return Some(LinkOutcome::Reconnect(GatewayError::Connectivity(
                    "session expired".into(),
                )));
            }
            ServerEvent::InputAudioBufferCommitted { .. } => {
                self.tracker.on_committed();
                self.buffer_errors = 0;
            }
            ServerEvent::InputAudioBufferCleared => self.tracker.reset(),
            ServerEvent::SpeechStarted { .. } => {
                self.caller_speaking = true;
                self.tracker.start_turn();
                self.emit(SessionEvent::SpeechStarted {
                    call_id: self.options.call_id.clone(),
                    during_response: self.response_active,
                });
            }
            ServerEvent::SpeechStopped { .. } => {
                self.caller_speaking = false;
                self.flush_transcript(Role::User).await;
            }
            ServerEvent::InputTranscriptDelta { delta } => {
                self.shared.transcripts().push_delta(Role::User, &delta, now);
            }
            ServerEvent::InputTranscriptCompleted { transcript } => {
                self.shared.transcripts().complete(Role::User, &transcript, now);
            }
            ServerEvent::ResponseCreated { .. } => self.response_active = true,
            ServerEvent::AudioDelta { response_id, delta } => {
                let started = Instant::now();
                match STANDARD.decode(delta.as_bytes()) {
                    Ok(audio) if !audio.is_empty() => {
                        let bytes = audio.len();
                        self.shared.update(|s| {
                            s.audio_deltas += 1;
                            s.audio_bytes_received += bytes as u64;
                        });
                        self.emit(SessionEvent::AudioDelta {
                            call_id: self.options.call_id.clone(),
                            payload: Bytes::from(audio),
                            meta: AudioDeltaMeta {
                                response_id,
                                bytes,
                                decode_us: started.elapsed().as_micros() as u64,
                                received_at: crate::get_timestamp(),
                            },
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(call_id = self.call_id(), "bad audio delta: {}", e),
                }
            }
            ServerEvent::ResponseTranscriptDelta { delta } => {
                self.shared
                    .transcripts()
                    .push_delta(Role::Assistant, &delta, now);
            }
            ServerEvent::ResponseTranscriptDone { transcript } => {
                self.shared
                    .transcripts()
                    .complete(Role::Assistant, &transcript, now);
            }
            ServerEvent::ResponseDone { .. } => {
                self.response_active = false;
                self.flush_transcript(Role::User).await;
                self.flush_transcript(Role::Assistant).await;
            }
            ServerEvent::Error { error } => return self.on_error(error),
            ServerEvent::Other => {}
        }
        None
    }
}
