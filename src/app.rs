use crate::{
    call::CallOrchestrator,
    config::Config,
    conversation::{ConversationStore, FileConversationStore, MemoryConversationStore},
    error::GatewayError,
    event::EventReceiver,
    media::{port_pool::PortPool, sender::RtpSender},
    realtime::{RealtimeConnector, RealtimeManager, WebsocketConnector},
    switch::{
        ari::{AriClient, AriEventStream},
        SwitchControl, SwitchEvent,
    },
};
use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub pool: Arc<PortPool>,
    pub sender: Arc<RtpSender>,
    pub realtime: Arc<RealtimeManager>,
    pub orchestrator: Arc<CallOrchestrator>,
    pub token: CancellationToken,
    session_events: Mutex<Option<EventReceiver>>,
    switch_events: Mutex<Option<mpsc::UnboundedReceiver<SwitchEvent>>>,
}

pub type AppState = Arc<AppStateInner>;

/// Wires the gateway together. Collaborators left unset are built from
/// the configuration: the ARI client and event stream, the websocket
/// connector and a file or in-memory conversation store.
#[derive(Default)]
pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub switch: Option<Arc<dyn SwitchControl>>,
    pub switch_events: Option<mpsc::UnboundedReceiver<SwitchEvent>>,
    pub connector: Option<Arc<dyn RealtimeConnector>>,
    pub store: Option<Arc<dyn ConversationStore>>,
    pub token: Option<CancellationToken>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom switch, fed by `events` instead of the ARI websocket.
    pub fn with_switch(
        mut self,
        switch: Arc<dyn SwitchControl>,
        events: mpsc::UnboundedReceiver<SwitchEvent>,
    ) -> Self {
        self.switch = Some(switch);
        self.switch_events = Some(events);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn RealtimeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        if let Err(issues) = config.validate() {
            let joined = issues
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::Configuration(joined).into());
        }
        let token = self.token.unwrap_or_default();

        let pool = Arc::new(PortPool::new(config.rtp.start_port, config.rtp.end_port)?);
        let bind_ip: IpAddr = config
            .rtp
            .bind_ip
            .parse()
            .map_err(|_| anyhow!("bad bind_ip {}", config.rtp.bind_ip))?;
        let sender = Arc::new(RtpSender::new(config.sender.clone(), bind_ip));

        let store: Arc<dyn ConversationStore> = match (self.store, &config.conversation_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileConversationStore::new(path).await?),
            (None, None) => Arc::new(MemoryConversationStore::new()),
        };

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebsocketConnector::new(&config.realtime)),
        };
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let realtime = Arc::new(RealtimeManager::new(
            config.realtime.clone(),
            connector,
            store.clone(),
            session_tx,
        ));

        let switch: Arc<dyn SwitchControl> = match self.switch {
            Some(switch) => switch,
            None => Arc::new(AriClient::new(&config.ari)?),
        };

        let orchestrator = Arc::new(CallOrchestrator::new(
            config.clone(),
            switch,
            pool.clone(),
            sender.clone(),
            realtime.clone(),
            store,
            token.child_token(),
        )?);

        info!(
            ports = %format!("{}-{}", config.rtp.start_port, config.rtp.end_port),
            codec = ?config.rtp.codec,
            app = config.ari.app,
            "voicebridge initialized"
        );

        Ok(Arc::new(AppStateInner {
            config,
            pool,
            sender,
            realtime,
            orchestrator,
            token,
            session_events: Mutex::new(Some(session_rx)),
            switch_events: Mutex::new(self.switch_events),
        }))
    }
}

/// Run until Ctrl-C or until the app token is cancelled, then tear down
/// every live call.
pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let session_events = state
        .session_events
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .ok_or_else(|| anyhow!("app is already running"))?;
    let injected = state
        .switch_events
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();

    let mut tasks = Vec::new();
    let switch_events = match injected {
        Some(events) => events,
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            let stream = AriEventStream::new(state.config.ari.clone());
            let stream_token = token.child_token();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = stream.run(tx, stream_token).await {
                    warn!("ARI event stream stopped: {}", e);
                }
            }));
            rx
        }
    };

    tasks.push(tokio::spawn(state.orchestrator.clone().run(
        switch_events,
        session_events,
        token.child_token(),
    )));
    tasks.push(state.pool.spawn_health_check(
        Duration::from_secs(state.config.rtp.health_check_interval_secs.max(1)),
        Duration::from_secs(state.config.rtp.lease_stale_secs),
        token.child_token(),
    ));
    tasks.push(state.realtime.spawn_transcript_sweeper(token.child_token()));

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
        }
        _ = token.cancelled() => {
            info!("application shutting down due to cancellation");
        }
    }

    let reports = state.orchestrator.shutdown_all().await;
    let failed = reports.iter().filter(|r| !r.errors.is_empty()).count();
    info!(calls = reports.len(), failed, "all calls cleaned up");
    token.cancel();

    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("background task did not stop in time");
        }
    }
    Ok(())
}
