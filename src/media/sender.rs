use super::codecs::CodecType;
use super::jitter::{FrameOutcome, JitterBuffer, JitterStats};
use super::rtp::encode_packet;
use crate::config::SenderConfig;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where a call's outbound audio goes.
#[derive(Debug, Clone)]
pub struct SenderTarget {
    pub host: String,
    pub port: u16,
    pub codec: CodecType,
    /// Local port to send from, usually the call's leased write-port.
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderCallStats {
    pub call_id: String,
    pub remote: String,
    pub ssrc: u32,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub bytes_in: u64,
    pub buffered_bytes: usize,
    pub target_bytes: usize,
    pub jitter: JitterStats,
}

/// Per-call sequencing state and playout buffer.
pub(crate) struct CallStream {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
    // marker goes on the first packet after silence
    marker_pending: bool,
    buffer: JitterBuffer,
    packets_sent: u64,
    send_errors: u64,
    bytes_in: u64,
}

impl CallStream {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        codec: CodecType,
        config: &SenderConfig,
    ) -> Self {
        let frame_bytes = codec.bytes_per_ms() * config.frame_ms as usize;
        Self {
            socket,
            remote,
            payload_type: codec.payload_type(),
            ssrc: rand::random(),
            sequence: rand::random(),
            timestamp: rand::random(),
            samples_per_frame: frame_bytes as u32,
            marker_pending: true,
            buffer: JitterBuffer::new(config, frame_bytes, codec.silence_byte()),
            packets_sent: 0,
            send_errors: 0,
            bytes_in: 0,
        }
    }

    pub(crate) fn push(&mut self, payload: &[u8]) {
        self.bytes_in += payload.len() as u64;
        self.buffer.push(payload);
    }

    /// Next packet for this tick, advancing sequence and timestamp only
    /// when a frame is actually emitted.
    pub(crate) fn next_packet(&mut self) -> Option<Vec<u8>> {
        let frame = match self.buffer.next_frame() {
            FrameOutcome::Frame(frame) => frame,
            FrameOutcome::Idle => {
                self.marker_pending = true;
                return None;
            }
            FrameOutcome::Underrun => return None,
        };
        let packet = encode_packet(
            self.payload_type,
            self.marker_pending,
            self.sequence,
            self.timestamp,
            self.ssrc,
            &frame,
        );
        self.marker_pending = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        match packet {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!("failed to encode RTP frame: {}", e);
                None
            }
        }
    }

    fn stats(&self, call_id: &str) -> SenderCallStats {
        SenderCallStats {
            call_id: call_id.to_string(),
            remote: self.remote.to_string(),
            ssrc: self.ssrc,
            packets_sent: self.packets_sent,
            send_errors: self.send_errors,
            bytes_in: self.bytes_in,
            buffered_bytes: self.buffer.len(),
            target_bytes: self.buffer.target_bytes(),
            jitter: self.buffer.stats().clone(),
        }
    }
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SenderShared {
    calls: Mutex<HashMap<String, CallStream>>,
}

impl SenderShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CallStream>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One pass over every registered call. Runs without suspending, so no
    /// call is ever observed half-updated.
    fn tick(&self) {
        let mut calls = self.lock();
        for (call_id, stream) in calls.iter_mut() {
            let Some(packet) = stream.next_packet() else {
                continue;
            };
            match stream.socket.try_send_to(&packet, stream.remote) {
                Ok(_) => {
                    stream.packets_sent += 1;
                    trace!(call_id, seq = stream.sequence.wrapping_sub(1), "RTP frame sent");
                }
                Err(e) => {
                    stream.send_errors += 1;
                    if stream.send_errors % 50 == 1 {
                        warn!(call_id, remote = %stream.remote, "RTP send failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Paces outbound audio for every active call from a single shared tick.
pub struct RtpSender {
    config: SenderConfig,
    bind_ip: IpAddr,
    shared: Arc<SenderShared>,
    ticker: Mutex<Option<Ticker>>,
}

impl RtpSender {
    pub fn new(config: SenderConfig, bind_ip: IpAddr) -> Self {
        Self {
            config,
            bind_ip,
            shared: Arc::new(SenderShared {
                calls: Mutex::new(HashMap::new()),
            }),
            ticker: Mutex::new(None),
        }
    }

    pub async fn initialize_call(&self, call_id: &str, target: SenderTarget) -> Result<()> {
        if target.port == 0 {
            return Err(anyhow!(
                "invalid RTP target port {} for call {}",
                target.port,
                call_id
            ));
        }
        let remote = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("cannot resolve RTP target {}", target.host))?;
        let local = SocketAddr::new(self.bind_ip, target.local_port.unwrap_or(0));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| anyhow!("failed to bind RTP sender socket {}: {}", local, e))?;
        let local_addr = socket.local_addr()?;
        let stream = CallStream::new(Arc::new(socket), remote, target.codec, &self.config);

        // the ticker lock orders registration against a concurrent last cleanup
        let mut ticker = self.lock_ticker();
        let replaced = self
            .shared
            .lock()
            .insert(call_id.to_string(), stream)
            .is_some();
        if replaced {
            warn!(call_id, "RTP sender re-initialized for call");
        }
        self.ensure_ticking(&mut ticker);
        drop(ticker);
        info!(call_id, %local_addr, %remote, codec = ?target.codec, "RTP sender initialized");
        Ok(())
    }

    /// Queue outbound audio. Returns false when the call is not initialized.
    pub fn send_audio(&self, call_id: &str, payload: &[u8]) -> bool {
        let mut calls = self.shared.lock();
        match calls.get_mut(call_id) {
            Some(stream) => {
                stream.push(payload);
                true
            }
            None => {
                trace!(call_id, len = payload.len(), "audio for unknown sender call dropped");
                false
            }
        }
    }

    /// Drop queued audio, e.g. when the caller barges in.
    pub fn flush_call(&self, call_id: &str) -> usize {
        let mut calls = self.shared.lock();
        match calls.get_mut(call_id) {
            Some(stream) => {
                let dropped = stream.buffer.len();
                stream.buffer.clear();
                debug!(call_id, dropped, "sender buffer flushed");
                dropped
            }
            None => 0,
        }
    }

    pub fn cleanup_call(&self, call_id: &str) -> Option<SenderCallStats> {
        let removed = {
            let mut ticker = self.lock_ticker();
            let mut calls = self.shared.lock();
            let removed = calls.remove(call_id);
            if calls.is_empty() {
                Self::stop_ticking(&mut ticker);
            }
            removed
        };
        let stream = removed?;
        let stats = stream.stats(call_id);
        info!(
            call_id,
            packets_sent = stats.packets_sent,
            underruns = stats.jitter.underruns,
            dropped_bytes = stats.jitter.dropped_bytes,
            "RTP sender cleaned up"
        );
        Some(stats)
    }

    pub fn call_stats(&self, call_id: &str) -> Option<SenderCallStats> {
        self.shared.lock().get(call_id).map(|s| s.stats(call_id))
    }

    pub fn active_calls(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_ticking(&self) -> bool {
        self.lock_ticker().is_some()
    }

    pub fn shutdown(&self) {
        let mut ticker = self.lock_ticker();
        self.shared.lock().clear();
        Self::stop_ticking(&mut ticker);
    }

    /// Taken before the calls lock whenever both are held.
    fn lock_ticker(&self) -> std::sync::MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_ticking(&self, ticker: &mut Option<Ticker>) {
        if ticker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let frame = self.config.frame_duration();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(frame);
            tick.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut ticks = IntervalStream::new(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.next() => shared.tick(),
                }
            }
        });
        debug!(frame_ms = frame.as_millis() as u64, "RTP sender tick started");
        *ticker = Some(Ticker { token, handle });
    }

    fn stop_ticking(ticker: &mut Option<Ticker>) {
        if let Some(ticker) = ticker.take() {
            ticker.token.cancel();
            ticker.handle.abort();
            debug!("RTP sender tick stopped");
        }
    }
}

impl Drop for RtpSender {
    fn drop(&mut self) {
        let mut ticker = self.lock_ticker();
        Self::stop_ticking(&mut ticker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpPacket;
    use std::time::Duration;

    async fn stream_to(remote: SocketAddr) -> CallStream {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        CallStream::new(
            Arc::new(socket),
            remote,
            CodecType::PCMU,
            &SenderConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_steady_input_advances_timestamp_and_sequence() {
        let mut stream = stream_to("127.0.0.1:9".parse().unwrap()).await;
        let mut previous: Option<RtpPacket> = None;
        for i in 0..70_000u32 {
            stream.push(&[(i % 200) as u8; 160]);
            let raw = stream.next_packet().expect("no skipped tick");
            let packet = RtpPacket::parse(&raw).unwrap();
            assert_eq!(packet.payload.len(), 160);
            if let Some(prev) = &previous {
                assert_eq!(
                    packet.header.sequence_number,
                    prev.header.sequence_number.wrapping_add(1)
                );
                assert_eq!(
                    packet.header.timestamp,
                    prev.header.timestamp.wrapping_add(160)
                );
                assert_eq!(packet.header.ssrc, prev.header.ssrc);
                assert!(!packet.header.marker);
            } else {
                assert!(packet.header.marker);
            }
            previous = Some(packet);
        }
        assert_eq!(stream.buffer.stats().underruns, 0);
    }

    #[tokio::test]
    async fn test_skipped_tick_does_not_advance_counters() {
        let mut stream = stream_to("127.0.0.1:9".parse().unwrap()).await;
        stream.push(&[1u8; 160]);
        let first = RtpPacket::parse(&stream.next_packet().unwrap()).unwrap();
        stream.push(&[1u8; 20]);
        assert!(stream.next_packet().is_none());
        stream.push(&[1u8; 140]);
        let second = RtpPacket::parse(&stream.next_packet().unwrap()).unwrap();
        assert_eq!(
            second.header.sequence_number,
            first.header.sequence_number.wrapping_add(1)
        );
        assert_eq!(second.header.timestamp, first.header.timestamp.wrapping_add(160));
    }

    #[tokio::test]
    async fn test_shared_tick_lifecycle_and_delivery() -> Result<()> {
        let receiver = UdpSocket::bind("127.0.0.1:0").await?;
        let port = receiver.local_addr()?.port();
        let sender = RtpSender::new(SenderConfig::default(), "127.0.0.1".parse()?);
        assert!(!sender.is_ticking());
        assert!(!sender.send_audio("nobody", &[0u8; 160]));

        let target = |port| SenderTarget {
            host: "127.0.0.1".to_string(),
            port,
            codec: CodecType::PCMU,
            local_port: None,
        };
        sender.initialize_call("a", target(port)).await?;
        sender.initialize_call("b", target(port)).await?;
        assert!(sender.is_ticking());
        assert_eq!(sender.active_calls(), 2);

        assert!(sender.send_audio("a", &[7u8; 320]));
        let mut buf = [0u8; 1500];
        let mut seqs = Vec::new();
        for _ in 0..2 {
            let (n, _) =
                tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                    .await??;
            let packet = RtpPacket::parse(&buf[..n]).unwrap();
            assert_eq!(packet.payload.len(), 160);
            assert_eq!(packet.header.payload_type, 0);
            seqs.push(packet.header.sequence_number);
        }
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));

        assert!(sender.cleanup_call("a").is_some());
        assert!(sender.is_ticking());
        assert!(sender.cleanup_call("b").is_some());
        assert!(!sender.is_ticking());
        assert!(sender.cleanup_call("b").is_none());
        Ok(())
    }

    fn discard_target() -> SenderTarget {
        SenderTarget {
            host: "127.0.0.1".to_string(),
            port: 9,
            codec: CodecType::PCMU,
            local_port: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tick_runs_whenever_calls_are_registered() -> Result<()> {
        let sender = Arc::new(RtpSender::new(SenderConfig::default(), "127.0.0.1".parse()?));
        sender.initialize_call("a", discard_target()).await?;
        assert!(sender.cleanup_call("a").is_some());
        assert!(!sender.is_ticking());
        sender.initialize_call("b", discard_target()).await?;
        assert!(sender.is_ticking());
        assert!(sender.cleanup_call("b").is_some());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                let call_id = format!("call-{}", i);
                for _ in 0..25 {
                    sender.initialize_call(&call_id, discard_target()).await.unwrap();
                    assert!(sender.is_ticking(), "{} registered without a tick", call_id);
                    assert!(sender.cleanup_call(&call_id).is_some());
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await?;
        }
        assert_eq!(sender.active_calls(), 0);
        assert!(!sender.is_ticking());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_invalid_port() {
        let sender = RtpSender::new(SenderConfig::default(), "127.0.0.1".parse().unwrap());
        let target = SenderTarget {
            host: "127.0.0.1".to_string(),
            port: 0,
            codec: CodecType::PCMU,
            local_port: None,
        };
        assert!(sender.initialize_call("a", target).await.is_err());
        assert!(!sender.is_ticking());
    }

    #[tokio::test]
    async fn test_flush_drops_queued_audio() -> Result<()> {
        let sender = RtpSender::new(SenderConfig::default(), "127.0.0.1".parse()?);
        let target = SenderTarget {
            host: "127.0.0.1".to_string(),
            port: 9,
            codec: CodecType::PCMA,
            local_port: None,
        };
        sender.initialize_call("a", target).await?;
        sender.send_audio("a", &[0u8; 1000]);
        assert!(sender.flush_call("a") > 0);
        assert_eq!(sender.call_stats("a").map(|s| s.buffered_bytes), Some(0));
        sender.shutdown();
        assert!(!sender.is_ticking());
        Ok(())
    }
}
