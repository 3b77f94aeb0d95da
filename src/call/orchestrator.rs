use super::{
    params::CallParams,
    registry::CallRegistry,
    state::{CallRecord, CallState, CallStatus},
};
use crate::{
    config::Config,
    conversation::ConversationStore,
    error::GatewayError,
    event::{EventReceiver, SessionEvent},
    media::{
        codecs::CodecType,
        listener::{AudioSink, ListenerRegistry, RtpListener},
        port_pool::{LeaseKind, PortPool},
        sender::{RtpSender, SenderTarget},
    },
    realtime::{RealtimeManager, SessionOptions},
    switch::{MediaRole, RawCallParams, SwitchControl, SwitchEvent},
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of tearing a call down. Cleanup never fails as a whole; steps
/// that went wrong are listed in `errors`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CleanupReport {
    pub call_id: String,
    pub reason: String,
    /// True when the call was unknown or already being cleaned up.
    pub skipped: bool,
    pub released_ports: Vec<u16>,
    pub errors: Vec<String>,
}

async fn run_step<F>(report: &mut CleanupReport, limit: Duration, step: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report.errors.push(format!("{}: {}", step, e)),
        Err(_) => report.errors.push(format!("{}: timed out", step)),
    }
}

/// Drives every call from answer to teardown.
pub struct CallOrchestrator {
    config: Arc<Config>,
    switch: Arc<dyn SwitchControl>,
    pool: Arc<PortPool>,
    sender: Arc<RtpSender>,
    realtime: Arc<RealtimeManager>,
    store: Arc<dyn ConversationStore>,
    listeners: ListenerRegistry,
    calls: CallRegistry,
    codec: CodecType,
    bind_ip: IpAddr,
    token: CancellationToken,
}

impl CallOrchestrator {
    pub fn new(
        config: Arc<Config>,
        switch: Arc<dyn SwitchControl>,
        pool: Arc<PortPool>,
        sender: Arc<RtpSender>,
        realtime: Arc<RealtimeManager>,
        store: Arc<dyn ConversationStore>,
        token: CancellationToken,
    ) -> Result<Self> {
        let bind_ip: IpAddr = config
            .rtp
            .bind_ip
            .parse()
            .map_err(|_| GatewayError::Configuration(format!("bad bind_ip {}", config.rtp.bind_ip)))?;
        Ok(Self {
            codec: config.rtp.codec,
            bind_ip,
            config,
            switch,
            pool,
            sender,
            realtime,
            store,
            listeners: ListenerRegistry::new(),
            calls: CallRegistry::new(),
            token,
        })
    }

    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call.cleanup_step_timeout_ms)
    }

    /// Answer a new call and start building its media pipeline. On any
    /// setup failure the call is torn down before the error is returned.
    pub async fn start_call(self: &Arc<Self>, raw: RawCallParams) -> Result<String> {
        let params = CallParams::parse(&raw)?;
        let call_id = params.call_id.clone();
        let token = self.token.child_token();
        self.calls.insert(CallRecord::new(params.clone(), token.clone()))?;
        info!(
            call_id,
            caller = params.caller.as_deref().unwrap_or_default(),
            extension = params.extension.as_deref().unwrap_or_default(),
            "call started"
        );

        if let Err(e) = self.setup_call(&params, &token).await {
            warn!(call_id, "call setup failed: {}", e);
            self.fail_call(&call_id, &e.to_string());
            self.cleanup_call(&call_id, "setup_failed").await;
            return Err(e);
        }
        Ok(call_id)
    }

    async fn setup_call(self: &Arc<Self>, params: &CallParams, token: &CancellationToken) -> Result<()> {
        let call_id = params.call_id.as_str();
        self.switch.answer(call_id).await?;
        self.transition(call_id, CallState::Answered)?;

        let metadata = HashMap::from([("caller".to_string(), params.caller.clone().unwrap_or_default())]);
        let read = self.pool.acquire(call_id, LeaseKind::Read, metadata.clone())?;
        let write = self.pool.acquire(call_id, LeaseKind::Write, metadata)?;
        if !self.calls.update_live(call_id, |c| {
            c.read_port = Some(read.port);
            c.write_port = Some(write.port);
        }) {
            self.pool.release_by_call_id(call_id);
            return Err(anyhow!("call {} ended during setup", call_id));
        }

        let listener = Arc::new(
            RtpListener::new(call_id.to_string(), SocketAddr::new(self.bind_ip, read.port))
                .with_stats_interval(Duration::from_secs(self.config.rtp.stats_interval_secs.max(1))),
        );
        let sink: Arc<dyn AudioSink> = self.realtime.clone();
        listener.start(sink, token).await?;
        self.listeners.insert(listener);

        let bridge = self.switch.create_bridge(&format!("call-{}", call_id)).await?;
        if !self.calls.update_live(call_id, |c| c.main_bridge = Some(bridge.clone())) {
            self.switch.destroy_bridge(&bridge).await.ok();
            return Err(anyhow!("call {} ended during setup", call_id));
        }
        self.switch.add_channel_to_bridge(&bridge, call_id).await?;

        self.realtime.initialize_session(
            SessionOptions {
                call_id: call_id.to_string(),
                instructions: params
                    .prompt
                    .clone()
                    .unwrap_or_else(|| self.config.realtime.instructions.clone()),
                voice: params
                    .voice
                    .clone()
                    .unwrap_or_else(|| self.config.realtime.voice.clone()),
                codec: self.codec,
            },
            token,
        )?;

        let snoop_id = MediaRole::Tap.channel_id(call_id);
        self.calls.add_alias(&snoop_id, call_id);
        let snoop = self
            .switch
            .create_snoop(call_id, &snoop_id, &MediaRole::Tap.app_args(call_id))
            .await?;
        self.calls.add_alias(&snoop, call_id);
        if !self.calls.update_live(call_id, |c| c.snoop_channel = Some(snoop.clone())) {
            self.switch.hangup(&snoop).await.ok();
            return Err(anyhow!("call {} ended during setup", call_id));
        }

        let write_id = MediaRole::Write.channel_id(call_id);
        self.calls.add_alias(&write_id, call_id);
        let external_host = format!("{}:{}", self.config.rtp.advertise_ip, write.port);
        let write_channel = self
            .switch
            .create_external_media(&write_id, &external_host, self.codec.switch_format())
            .await?;
        self.calls.add_alias(&write_channel, call_id);
        if !self
            .calls
            .update_live(call_id, |c| c.write_channel = Some(write_channel.clone()))
        {
            self.switch.hangup(&write_channel).await.ok();
            return Err(anyhow!("call {} ended during setup", call_id));
        }

        self.transition(call_id, CallState::PendingMedia)?;
        info!(
            call_id,
            read_port = read.port,
            write_port = write.port,
            "call answered, waiting for media legs"
        );
        self.spawn_media_timer(call_id, token.clone());
        // legs may have come up while setup was still running
        self.check_pipeline_ready(call_id).await;
        Ok(())
    }

    fn transition(&self, call_id: &str, to: CallState) -> Result<()> {
        self.calls
            .with_call(call_id, |c| c.transition(to))
            .ok_or_else(|| GatewayError::UnknownCall(call_id.to_string()))??;
        Ok(())
    }

    fn fail_call(&self, call_id: &str, reason: &str) {
        self.calls.with_call(call_id, |c| {
            if c.state.can_transition(CallState::Failed) {
                c.state = CallState::Failed;
                c.failure = Some(reason.to_string());
            }
        });
    }

    fn spawn_media_timer(self: &Arc<Self>, call_id: &str, token: CancellationToken) {
        let timeout = Duration::from_millis(self.config.call.media_setup_timeout_ms);
        let this = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let pending = this
                        .calls
                        .with_call(&call_id, |c| c.state == CallState::PendingMedia || c.state == CallState::Answered)
                        .unwrap_or(false);
                    if pending {
                        warn!(call_id, timeout_ms = timeout.as_millis() as u64, "media setup timed out");
                        this.fail_call(&call_id, "media setup timed out");
                        this.cleanup_call(&call_id, "media_timeout").await;
                    }
                }
            }
        });
    }

    /// A channel the gateway created entered the Stasis application.
    pub async fn on_media_channel_started(
        self: &Arc<Self>,
        channel_id: &str,
        call_id: &str,
        role: MediaRole,
    ) -> Result<()> {
        let Some(call_id) = self.calls.resolve(call_id) else {
            warn!(channel_id, call_id, %role, "media channel for unknown call, hanging up");
            self.switch.hangup(channel_id).await.ok();
            return Err(GatewayError::UnknownCall(call_id.to_string()).into());
        };
        self.calls.add_alias(channel_id, &call_id);
        debug!(call_id, channel_id, %role, "media channel started");

        let result = match role {
            MediaRole::Tap => self.setup_read_leg(&call_id, channel_id).await,
            MediaRole::Write => self.setup_write_leg(&call_id, channel_id).await,
            MediaRole::TapMedia => Ok(()),
        };
        if let Err(e) = result {
            warn!(call_id, %role, "media leg setup failed: {}", e);
            self.fail_call(&call_id, &e.to_string());
            self.cleanup_call(&call_id, "setup_failed").await;
            return Err(e);
        }
        Ok(())
    }

    async fn setup_read_leg(&self, call_id: &str, snoop_channel: &str) -> Result<()> {
        let read_port = self
            .calls
            .with_call(call_id, |c| c.read_port)
            .flatten()
            .ok_or_else(|| anyhow!("call {} has no read port", call_id))?;

        let bridge = self.switch.create_bridge(&format!("tap-{}", call_id)).await?;
        if !self.calls.update_live(call_id, |c| c.tap_bridge = Some(bridge.clone())) {
            self.switch.destroy_bridge(&bridge).await.ok();
            return Err(anyhow!("call {} ended during setup", call_id));
        }
        self.switch.add_channel_to_bridge(&bridge, snoop_channel).await?;

        let tap_media_id = MediaRole::TapMedia.channel_id(call_id);
        self.calls.add_alias(&tap_media_id, call_id);
        let external_host = format!("{}:{}", self.config.rtp.advertise_ip, read_port);
        let tap_media = self
            .switch
            .create_external_media(&tap_media_id, &external_host, self.codec.switch_format())
            .await?;
        self.calls.add_alias(&tap_media, call_id);
        if !self
            .calls
            .update_live(call_id, |c| c.tap_media_channel = Some(tap_media.clone()))
        {
            self.switch.hangup(&tap_media).await.ok();
            return Err(anyhow!("call {} ended during setup", call_id));
        }
        self.switch.add_channel_to_bridge(&bridge, &tap_media).await?;

        self.calls.update_live(call_id, |c| c.read_stream_ready = true);
        info!(call_id, read_port, "read leg ready");
        self.check_pipeline_ready(call_id).await;
        Ok(())
    }

    async fn setup_write_leg(&self, call_id: &str, write_channel: &str) -> Result<()> {
        let (bridge, write_port) = self
            .calls
            .with_call(call_id, |c| (c.main_bridge.clone(), c.write_port))
            .ok_or_else(|| GatewayError::UnknownCall(call_id.to_string()))?;
        let bridge = bridge.ok_or_else(|| anyhow!("call {} has no bridge", call_id))?;
        let write_port = write_port.ok_or_else(|| anyhow!("call {} has no write port", call_id))?;

        self.switch.add_channel_to_bridge(&bridge, write_channel).await?;
        let endpoint = self.switch.local_rtp_endpoint(write_channel).await?;
        self.sender
            .initialize_call(
                call_id,
                SenderTarget {
                    host: endpoint.host.clone(),
                    port: endpoint.port,
                    codec: self.codec,
                    local_port: Some(write_port),
                },
            )
            .await?;

        self.calls.update_live(call_id, |c| c.write_stream_ready = true);
        info!(
            call_id,
            remote = %format!("{}:{}", endpoint.host, endpoint.port),
            "write leg ready"
        );
        self.check_pipeline_ready(call_id).await;
        Ok(())
    }

    /// Promote the call once both legs are ready. Exactly one caller sees
    /// `true` per call; it triggers the greeting and optional recording.
    pub async fn check_pipeline_ready(&self, call_id: &str) -> bool {
        let activated = self
            .calls
            .with_call(call_id, |c| c.try_activate())
            .unwrap_or(false);
        if !activated {
            return false;
        }
        info!(call_id, "pipeline active");

        let greeting = self
            .calls
            .with_call(call_id, |c| c.params.greeting.clone())
            .flatten()
            .or_else(|| self.config.realtime.greeting.clone());
        if let Some(greeting) = greeting {
            self.realtime.request_response(call_id, Some(greeting));
        }

        if self.config.call.record {
            self.start_recording(call_id).await;
        }
        true
    }

    async fn start_recording(&self, call_id: &str) {
        let Some(bridge) = self.calls.with_call(call_id, |c| c.main_bridge.clone()).flatten() else {
            return;
        };
        let name = format!("voicebridge-{}", call_id.replace(['.', '/'], "-"));
        match self
            .switch
            .record_bridge(&bridge, &name, &self.config.call.record_format)
            .await
        {
            Ok(()) => {
                self.calls.update_live(call_id, |c| c.recording = Some(name.clone()));
                info!(call_id, name, "recording started");
            }
            Err(e) => warn!(call_id, "failed to start recording: {}", e),
        }
    }

    /// Tear the call down in order. Every step runs even if an earlier one
    /// failed, and the call always leaves the registry.
    pub async fn cleanup_call(&self, call_id: &str, reason: &str) -> CleanupReport {
        let canonical = self
            .calls
            .resolve(call_id)
            .unwrap_or_else(|| call_id.to_string());
        let mut report = CleanupReport {
            call_id: canonical.clone(),
            reason: reason.to_string(),
            ..Default::default()
        };
        let Some(call) = self.calls.begin_cleanup(&canonical) else {
            debug!(call_id = canonical, reason, "cleanup skipped");
            report.skipped = true;
            return report;
        };
        let call_id = canonical.as_str();
        let limit = self.step_timeout();
        info!(call_id, reason, "cleaning up call");

        call.token.cancel();

        self.listeners.stop(call_id).await;
        if let Some(stats) = self.sender.cleanup_call(call_id) {
            debug!(call_id, packets = stats.packets_sent, "sender stats");
        }
        report.released_ports = self.pool.release_by_call_id(call_id);

        self.realtime.close_session(call_id).await;

        if let Some(name) = &call.recording {
            run_step(&mut report, limit, "stop_recording", self.switch.stop_recording(name)).await;
        }
        for channel in call.aux_channels() {
            run_step(&mut report, limit, "hangup_aux", self.switch.hangup(&channel)).await;
        }
        run_step(&mut report, limit, "hangup_caller", self.switch.hangup(call_id)).await;
        for bridge in [&call.tap_bridge, &call.main_bridge].into_iter().flatten() {
            run_step(&mut report, limit, "destroy_bridge", self.switch.destroy_bridge(bridge)).await;
        }

        let status = match &call.failure {
            Some(_) => format!("failed:{}", reason),
            None => reason.to_string(),
        };
        run_step(&mut report, limit, "finalize", self.store.finalize(call_id, &status)).await;

        self.calls.remove(call_id);
        if report.errors.is_empty() {
            info!(call_id, ports = ?report.released_ports, "call cleaned up");
        } else {
            warn!(call_id, errors = ?report.errors, "call cleaned up with errors");
        }
        report
    }

    pub fn get_call_status(&self, call_id: &str) -> Option<CallStatus> {
        self.calls.status(call_id)
    }

    pub fn get_all_call_statuses(&self) -> Vec<CallStatus> {
        self.calls.statuses()
    }

    pub async fn shutdown_all(&self) -> Vec<CleanupReport> {
        let call_ids = self.calls.call_ids();
        info!(calls = call_ids.len(), "shutting down all calls");
        let mut reports = Vec::with_capacity(call_ids.len());
        for call_id in call_ids {
            reports.push(self.cleanup_call(&call_id, "shutdown").await);
        }
        self.sender.shutdown();
        reports
    }

    pub async fn handle_switch_event(self: &Arc<Self>, event: SwitchEvent) {
        match event {
            SwitchEvent::CallStarted(raw) => {
                let channel_id = raw.channel_id.clone();
                if let Err(e) = self.start_call(raw).await {
                    warn!(channel_id, "call start failed: {}", e);
                    // a duplicate start leaves the live call alone
                    if self.calls.resolve(&channel_id).is_none() {
                        self.switch.hangup(&channel_id).await.ok();
                    }
                }
            }
            SwitchEvent::MediaChannelStarted {
                channel_id,
                call_id,
                role,
            } => {
                self.on_media_channel_started(&channel_id, &call_id, role)
                    .await
                    .ok();
            }
            SwitchEvent::ChannelDestroyed { channel_id, .. }
            | SwitchEvent::HangupRequested { channel_id }
            | SwitchEvent::StasisEnded { channel_id } => {
                let Some(call_id) = self.calls.resolve(&channel_id) else {
                    debug!(channel_id, "channel event for unknown call");
                    return;
                };
                let reason = if call_id == channel_id {
                    "hangup"
                } else {
                    "media_channel_lost"
                };
                self.cleanup_call(&call_id, reason).await;
            }
        }
    }

    pub async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::AudioDelta {
                call_id, payload, ..
            } => {
                if !self.sender.send_audio(&call_id, &payload) {
                    debug!(call_id, len = payload.len(), "audio delta before write leg is ready");
                }
            }
            SessionEvent::SpeechStarted {
                call_id,
                during_response,
            } => {
                if during_response {
                    let dropped = self.sender.flush_call(&call_id);
                    debug!(call_id, dropped, "barge-in, playback flushed");
                }
            }
            SessionEvent::Ready { call_id } => debug!(call_id, "realtime session ready"),
            SessionEvent::Transcript { call_id, role, text } => {
                debug!(call_id, ?role, text, "transcript")
            }
            SessionEvent::Reconnecting {
                call_id,
                attempt,
                delay_ms,
            } => info!(call_id, attempt, delay_ms, "realtime reconnecting"),
            SessionEvent::Reconnected { call_id, attempt } => {
                info!(call_id, attempt, "realtime reconnected")
            }
            SessionEvent::Failed { call_id, error } => {
                warn!(call_id, error, "realtime session failed");
                self.fail_call(&call_id, &error);
                self.cleanup_call(&call_id, "session_failed").await;
            }
            SessionEvent::Closed { call_id } => {
                self.cleanup_call(&call_id, "session_closed").await;
            }
        }
    }

    /// Event loop. Switch events and session lifecycle events each get
    /// their own task; audio deltas are forwarded inline to keep order.
    pub async fn run(
        self: Arc<Self>,
        mut switch_events: mpsc::UnboundedReceiver<SwitchEvent>,
        mut session_events: EventReceiver,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = switch_events.recv() => match event {
                    Some(event) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_switch_event(event).await });
                    }
                    None => {
                        info!("switch event stream ended");
                        break;
                    }
                },
                event = session_events.recv() => match event {
                    Some(event @ SessionEvent::AudioDelta { .. }) | Some(event @ SessionEvent::SpeechStarted { .. }) => {
                        self.handle_session_event(event).await;
                    }
                    Some(event) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_session_event(event).await });
                    }
                    None => break,
                },
            }
        }
        debug!("call orchestrator loop stopped");
    }
}
