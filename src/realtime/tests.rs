use super::*;
use crate::{
    conversation::{MemoryConversationStore, Role},
    event::{EventReceiver, SessionEvent},
    media::codecs::CodecType,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};

struct Harness {
    manager: Arc<RealtimeManager>,
    connector: Arc<MemoryConnector>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    events: EventReceiver,
    store: Arc<MemoryConversationStore>,
    token: CancellationToken,
}

fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        api_key: Some("sk-test".to_string()),
        handshake_timeout_ms: 2000,
        fast_commit_delay_ms: 5,
        commit_delay_ms: 30,
        reconnect_base_ms: 20,
        reconnect_max_ms: 80,
        reconnect_max_attempts: 5,
        transcript_stale_ms: 50,
        ..Default::default()
    }
}

impl Harness {
    fn new(config: RealtimeConfig) -> Self {
        let (connector, peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let store = Arc::new(MemoryConversationStore::new());
        let (tx, events) = mpsc::unbounded_channel();
        let manager = Arc::new(RealtimeManager::new(
            config,
            connector.clone(),
            store.clone(),
            tx,
        ));
        Self {
            manager,
            connector,
            peers,
            events,
            store,
            token: CancellationToken::new(),
        }
    }

    fn start(&self, call_id: &str) {
        self.manager
            .initialize_session(
                SessionOptions {
                    call_id: call_id.to_string(),
                    instructions: "You answer the phone.".to_string(),
                    voice: "verse".to_string(),
                    codec: CodecType::PCMU,
                },
                &self.token,
            )
            .unwrap();
    }

    async fn peer(&mut self) -> MemoryPeer {
        tokio::time::timeout(Duration::from_secs(3), self.peers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    async fn event<F: Fn(&SessionEvent) -> bool>(&mut self, matches: F) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }
}

async fn next(peer: &mut MemoryPeer) -> Value {
    tokio::time::timeout(Duration::from_secs(3), peer.recv_json())
        .await
        .expect("timed out waiting for client message")
        .expect("link closed")
}

async fn handshake(peer: &mut MemoryPeer) -> Value {
    peer.send_json(json!({"type": "session.created", "session": {"id": "sess_1"}}));
    let update = next(peer).await;
    assert_eq!(update["type"], "session.update");
    peer.send_json(json!({"type": "session.updated", "session": {}}));
    update
}

fn speech(len: usize) -> Bytes {
    // 0x00 is a loud sample in mu-law
    Bytes::from(vec![0x00u8; len])
}

fn decoded(append: &Value) -> Vec<u8> {
    STANDARD
        .decode(append["audio"].as_str().unwrap_or_default())
        .unwrap()
}

#[tokio::test]
async fn test_handshake_configures_session_and_flushes_in_order() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    assert!(h.manager.send_audio("c1", Bytes::from(vec![1u8; 160])));
    assert!(h.manager.send_audio("c1", Bytes::from(vec![2u8; 160])));

    let update = handshake(&mut peer).await;
    assert_eq!(update["session"]["voice"], "verse");
    assert_eq!(update["session"]["instructions"], "You answer the phone.");
    assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["output_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");

    let first = next(&mut peer).await;
    assert_eq!(first["type"], "input_audio_buffer.append");
    assert_eq!(decoded(&first), vec![1u8; 160]);
    let second = next(&mut peer).await;
    assert_eq!(decoded(&second), vec![2u8; 160]);

    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;
    let stats = h.manager.session_stats("c1").unwrap();
    assert_eq!(stats.state, SessionState::Ready);
    assert_eq!(stats.chunks_sent, 2);
}

#[tokio::test]
async fn test_no_commit_below_minimum_duration() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;

    // 40 ms of audio, threshold is 50 + 10 ms
    h.manager.send_audio("c1", speech(160));
    h.manager.send_audio("c1", speech(160));
    assert_eq!(next(&mut peer).await["type"], "input_audio_buffer.append");
    assert_eq!(next(&mut peer).await["type"], "input_audio_buffer.append");
    let waited = tokio::time::timeout(Duration::from_millis(150), peer.recv_json()).await;
    assert!(waited.is_err(), "commit sent below minimum: {:?}", waited);

    h.manager.send_audio("c1", speech(160));
    assert_eq!(next(&mut peer).await["type"], "input_audio_buffer.append");
    assert_eq!(next(&mut peer).await["type"], "input_audio_buffer.commit");
    assert_eq!(h.manager.session_stats("c1").unwrap().commits, 1);
}

#[tokio::test]
async fn test_forced_reconnect_exactly_at_buffer_error_threshold() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;

    let too_small = json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "code": "input_audio_buffer_commit_empty",
            "message": "buffer too small"
        }
    });
    peer.send_json(too_small.clone());
    peer.send_json(too_small.clone());
    let early = tokio::time::timeout(Duration::from_millis(150), h.peers.recv()).await;
    assert!(early.is_err(), "reconnected before threshold");
    assert_eq!(h.connector.attempts().len(), 1);
    assert_eq!(h.manager.session_stats("c1").unwrap().buffer_errors, 2);

    peer.send_json(too_small);
    let event = h
        .event(|e| matches!(e, SessionEvent::Reconnecting { .. }))
        .await;
    assert!(matches!(event, SessionEvent::Reconnecting { attempt: 1, .. }));
    let _again = h.peer().await;
    assert_eq!(h.connector.attempts().len(), 2);
}

#[tokio::test]
async fn test_commit_ack_resets_buffer_error_run() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;

    let too_small = json!({
        "type": "error",
        "error": {"code": "input_audio_buffer_commit_empty", "message": "buffer too small"}
    });
    peer.send_json(too_small.clone());
    peer.send_json(too_small.clone());
    peer.send_json(json!({"type": "input_audio_buffer.committed", "item_id": "i1"}));
    peer.send_json(too_small);
    let reconnect = tokio::time::timeout(Duration::from_millis(150), h.peers.recv()).await;
    assert!(reconnect.is_err());
}

#[tokio::test]
async fn test_abnormal_close_reconnects_and_flushes_outage_audio_first() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;

    peer.close(1006, "abnormal");
    h.event(|e| matches!(e, SessionEvent::Reconnecting { .. }))
        .await;
    for i in 0..5u8 {
        let mut chunk = vec![0x00u8; 160];
        chunk[0] = i;
        h.manager.send_audio("c1", Bytes::from(chunk));
    }

    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    for i in 0..5u8 {
        let append = next(&mut peer).await;
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(decoded(&append)[0], i);
    }
    assert_eq!(next(&mut peer).await["type"], "input_audio_buffer.commit");
    assert_eq!(next(&mut peer).await["type"], "response.create");

    h.manager.send_audio("c1", Bytes::from(vec![9u8; 160]));
    let fresh = next(&mut peer).await;
    assert_eq!(decoded(&fresh), vec![9u8; 160]);

    let event = h
        .event(|e| matches!(e, SessionEvent::Reconnected { .. }))
        .await;
    assert!(matches!(event, SessionEvent::Reconnected { attempt: 1, .. }));
}

#[tokio::test]
async fn test_backoff_grows_until_budget_then_fails() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let peer = h.peer().await;
    h.connector.set_refuse(true);
    peer.close(1011, "server error");

    let failed = h
        .event(|e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    assert_eq!(failed.call_id(), "c1");

    // initial connect plus one per scheduled retry
    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 6);
    let nominal = [20u64, 40, 80, 80, 80];
    for (i, pair) in attempts.windows(2).enumerate() {
        let gap = pair[1].duration_since(pair[0]);
        let floor = Duration::from_millis(nominal[i] * 8 / 10);
        assert!(gap >= floor, "retry {} came after {:?}", i + 1, gap);
    }
    assert_eq!(h.manager.session_stats("c1").unwrap().state, SessionState::Error);
}

#[tokio::test]
async fn test_application_close_code_is_fatal() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    peer.close(4001, "invalid session");
    h.event(|e| matches!(e, SessionEvent::Failed { .. })).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test]
async fn test_authentication_error_is_not_retried() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let peer = h.peer().await;
    peer.send_json(json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "invalid_api_key", "message": "Incorrect API key provided"}
    }));
    let failed = h
        .event(|e| matches!(e, SessionEvent::Failed { .. }))
        .await;
    match failed {
        SessionEvent::Failed { error, .. } => assert!(error.contains("authentication")),
        _ => unreachable!(),
    }
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test]
async fn test_rate_limit_error_backs_off_and_reconnects() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;

    peer.send_json(json!({
        "type": "error",
        "error": {"type": "rate_limit_error", "code": "rate_limit_exceeded", "message": "Rate limit reached"}
    }));
    let event = h
        .event(|e| matches!(e, SessionEvent::Reconnecting { .. }))
        .await;
    match event {
        SessionEvent::Reconnecting {
            attempt, delay_ms, ..
        } => {
            assert_eq!(attempt, 1);
            // base 20 ms with +/-20% jitter
            assert!((15..=24).contains(&delay_ms), "delay {} ms", delay_ms);
        }
        _ => unreachable!(),
    }

    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Reconnected { attempt: 1, .. }))
        .await;
    assert_eq!(h.connector.attempts().len(), 2);
    assert_eq!(h.manager.session_stats("c1").unwrap().reconnects, 1);
}

#[tokio::test]
async fn test_normal_close_reports_closed() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    peer.close(1000, "bye");
    h.event(|e| matches!(e, SessionEvent::Closed { .. })).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test]
async fn test_audio_delta_and_assistant_transcript() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;

    peer.send_json(json!({"type": "response.created", "response": {"id": "r1"}}));
    peer.send_json(json!({
        "type": "response.audio.delta",
        "response_id": "r1",
        "delta": STANDARD.encode([0xFFu8; 160]),
    }));
    peer.send_json(json!({"type": "response.audio_transcript.delta", "delta": "Hello"}));
    peer.send_json(json!({"type": "response.audio_transcript.delta", "delta": " there"}));
    peer.send_json(json!({"type": "response.done", "response": {}}));

    match h
        .event(|e| matches!(e, SessionEvent::AudioDelta { .. }))
        .await
    {
        SessionEvent::AudioDelta { payload, meta, .. } => {
            assert_eq!(payload.len(), 160);
            assert_eq!(meta.bytes, 160);
            assert_eq!(meta.response_id.as_deref(), Some("r1"));
        }
        _ => unreachable!(),
    }
    match h
        .event(|e| matches!(e, SessionEvent::Transcript { .. }))
        .await
    {
        SessionEvent::Transcript { role, text, .. } => {
            assert_eq!(role, Role::Assistant);
            assert_eq!(text, "Hello there");
        }
        _ => unreachable!(),
    }
    let record = h.store.record("c1").unwrap();
    assert_eq!(record.messages.len(), 1);
    assert_eq!(record.messages[0].text, "Hello there");
}

#[tokio::test]
async fn test_speech_during_response_is_reported_as_barge_in() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;

    peer.send_json(json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 10}));
    let first = h
        .event(|e| matches!(e, SessionEvent::SpeechStarted { .. }))
        .await;
    assert!(matches!(
        first,
        SessionEvent::SpeechStarted {
            during_response: false,
            ..
        }
    ));

    peer.send_json(json!({"type": "response.created", "response": {}}));
    peer.send_json(json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 900}));
    let second = h
        .event(|e| matches!(e, SessionEvent::SpeechStarted { .. }))
        .await;
    assert!(matches!(
        second,
        SessionEvent::SpeechStarted {
            during_response: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stale_caller_transcript_is_swept() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    h.event(|e| matches!(e, SessionEvent::Ready { .. })).await;

    peer.send_json(json!({
        "type": "conversation.item.input_audio_transcription.delta",
        "delta": "I need help"
    }));
    // let the worker take the delta before it goes stale
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.manager.sweep_transcripts().await, 0);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.manager.sweep_transcripts().await, 1);

    let record = h.store.record("c1").unwrap();
    assert_eq!(record.messages[0].role, Role::User);
    assert_eq!(record.messages[0].text, "I need help");
}

#[tokio::test]
async fn test_close_session_flushes_transcripts() {
    let mut h = Harness::new(test_config());
    h.start("c1");
    let mut peer = h.peer().await;
    handshake(&mut peer).await;
    peer.send_json(json!({
        "type": "response.audio_transcript.delta",
        "delta": "Goodbye"
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(h.manager.close_session("c1").await);
    assert!(!h.manager.close_session("c1").await);
    assert!(!h.manager.has_session("c1"));
    assert!(!h.manager.send_audio("c1", speech(160)));

    let record = h.store.record("c1").unwrap();
    assert_eq!(record.messages[0].text, "Goodbye");
}

#[tokio::test]
async fn test_duplicate_session_rejected() {
    let h = Harness::new(test_config());
    h.start("c1");
    let again = h.manager.initialize_session(
        SessionOptions {
            call_id: "c1".to_string(),
            instructions: String::new(),
            voice: "alloy".to_string(),
            codec: CodecType::PCMU,
        },
        &h.token,
    );
    assert!(again.is_err());
    assert_eq!(h.manager.active_sessions(), vec!["c1".to_string()]);
    h.token.cancel();
}
