use super::rtp::{RtpPacket, RtpParseError};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const UDP_BUFFER_SIZE: usize = 2048;

/// Receives caller audio decoded from RTP, one chunk per packet.
pub trait AudioSink: Send + Sync {
    fn deliver(&self, call_id: &str, payload: Bytes);
}

#[derive(Debug, Default)]
pub struct ListenerCounters {
    pub packets_received: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ListenerStats {
    pub packets_received: u64,
    pub invalid_packets: u64,
    pub errors: u64,
    pub bytes_forwarded: u64,
}

impl ListenerCounters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// UDP receiver bound to one call's leased read-port.
pub struct RtpListener {
    call_id: String,
    bind_addr: SocketAddr,
    stats_interval: Duration,
    counters: Arc<ListenerCounters>,
    running: Mutex<Option<Running>>,
}

impl RtpListener {
    pub fn new(call_id: String, bind_addr: SocketAddr) -> Self {
        Self {
            call_id,
            bind_addr,
            stats_interval: Duration::from_secs(10),
            counters: Arc::new(ListenerCounters::default()),
            running: Mutex::new(None),
        }
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Bind the socket and start forwarding payloads to `sink`.
    /// Fails if this listener is already bound.
    pub async fn start(
        &self,
        sink: Arc<dyn AudioSink>,
        parent: &CancellationToken,
    ) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(anyhow!(
                "listener for {} already bound on {}",
                self.call_id,
                self.bind_addr
            ));
        }
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow!("failed to bind RTP listener {}: {}", self.bind_addr, e))?;
        let local_addr = socket.local_addr()?;

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(anyhow!("listener for {} already bound", self.call_id));
        }
        let token = parent.child_token();
        let handle = tokio::spawn(receive_loop(
            self.call_id.clone(),
            socket,
            sink,
            self.counters.clone(),
            self.stats_interval,
            token.clone(),
        ));
        *running = Some(Running {
            token,
            handle,
            local_addr,
        });
        info!(call_id = self.call_id, %local_addr, "RTP listener started");
        Ok(local_addr)
    }

    /// Stop receiving and close the socket. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = running {
            running.token.cancel();
            running.handle.await.ok();
            info!(
                call_id = self.call_id,
                local_addr = %running.local_addr,
                stats = ?self.stats(),
                "RTP listener stopped"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.local_addr)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }
}

async fn receive_loop(
    call_id: String,
    socket: UdpSocket,
    sink: Arc<dyn AudioSink>,
    counters: Arc<ListenerCounters>,
    stats_interval: Duration,
    token: CancellationToken,
) {
    let mut buf = [0u8; UDP_BUFFER_SIZE];
    let mut stats_ticker = tokio::time::interval(stats_interval);
    stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = stats_ticker.tick() => {
                debug!(call_id, stats = ?counters.snapshot(), "RTP listener stats");
            }
            result = socket.recv_from(&mut buf) => {
                let (n, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(call_id, "RTP receive error: {}", e);
                        continue;
                    }
                };
                counters.packets_received.fetch_add(1, Ordering::Relaxed);
                match RtpPacket::parse(&buf[..n]) {
                    Ok(packet) => {
                        counters
                            .bytes_forwarded
                            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                        sink.deliver(&call_id, packet.payload);
                    }
                    Err(RtpParseError::EmptyPayload) => {
                        trace!(call_id, %from, "RTP packet without payload");
                    }
                    Err(e) => {
                        counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                        trace!(call_id, %from, len = n, "invalid RTP packet: {}", e);
                    }
                }
            }
        }
    }
}

/// Live listeners keyed by call id.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Arc<RtpListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listener: Arc<RtpListener>) -> Option<Arc<RtpListener>> {
        self.lock()
            .insert(listener.call_id().to_string(), listener)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<RtpListener>> {
        self.lock().get(call_id).cloned()
    }

    /// Remove and stop the call's listener. Returns false when none existed.
    pub async fn stop(&self, call_id: &str) -> bool {
        let listener = self.lock().remove(call_id);
        match listener {
            Some(listener) => {
                listener.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RtpListener>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
