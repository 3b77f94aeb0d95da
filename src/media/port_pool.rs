use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortLease {
    pub port: u16,
    pub call_id: String,
    pub kind: LeaseKind,
    pub leased_at: DateTime<Utc>,
    #[serde(skip)]
    pub acquired: Instant,
    pub metadata: HashMap<String, String>,
}

/// Statistics for port allocation
#[derive(Clone, Debug, Serialize)]
pub struct PortPoolStats {
    pub total_ports: usize,
    pub leased_ports: usize,
    pub available_ports: usize,
}

struct PoolInner {
    available: BTreeSet<u16>,
    leases: HashMap<u16, PortLease>,
}

/// Leases even RTP ports to calls. The odd port above each lease is
/// left for RTCP and never handed out.
pub struct PortPool {
    start_port: u16,
    end_port: u16,
    inner: Mutex<PoolInner>,
}

impl PortPool {
    /// Create a pool over the inclusive range, using even ports only.
    pub fn new(start_port: u16, end_port: u16) -> Result<Self, GatewayError> {
        if start_port >= end_port {
            return Err(GatewayError::Configuration(format!(
                "invalid port range {}-{}",
                start_port, end_port
            )));
        }
        let first = start_port + start_port % 2;
        let available: BTreeSet<u16> = (first..=end_port).step_by(2).collect();
        info!(
            start_port,
            end_port,
            ports = available.len(),
            "port pool initialized"
        );
        Ok(Self {
            start_port,
            end_port,
            inner: Mutex::new(PoolInner {
                available,
                leases: HashMap::new(),
            }),
        })
    }

    /// Lease a port for `call_id`. A call already holding a lease of the
    /// same kind gets its existing lease back.
    pub fn acquire(
        &self,
        call_id: &str,
        kind: LeaseKind,
        metadata: HashMap<String, String>,
    ) -> Result<PortLease, GatewayError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .leases
            .values()
            .find(|l| l.call_id == call_id && l.kind == kind)
        {
            debug!(call_id, port = existing.port, ?kind, "reusing existing lease");
            return Ok(existing.clone());
        }
        let port = match inner.available.pop_first() {
            Some(port) => port,
            None => {
                warn!(call_id, ?kind, "port pool exhausted");
                return Err(GatewayError::PoolExhausted);
            }
        };
        let lease = PortLease {
            port,
            call_id: call_id.to_string(),
            kind,
            leased_at: Utc::now(),
            acquired: Instant::now(),
            metadata,
        };
        inner.leases.insert(port, lease.clone());
        debug!(call_id, port, ?kind, "port leased");
        Ok(lease)
    }

    /// Return a port to the pool. When `call_id` is given it must own the
    /// lease, which guards against a late double release.
    pub fn release(&self, port: u16, call_id: Option<&str>) -> bool {
        let mut inner = self.lock();
        match inner.leases.get(&port) {
            None => {
                debug!(port, "release of unleased port ignored");
                return false;
            }
            Some(lease) => {
                if let Some(call_id) = call_id {
                    if lease.call_id != call_id {
                        warn!(
                            port,
                            owner = lease.call_id,
                            call_id,
                            "release rejected, lease owned by another call"
                        );
                        return false;
                    }
                }
            }
        }
        inner.leases.remove(&port);
        inner.available.insert(port);
        debug!(port, "port released");
        true
    }

    pub fn release_by_call_id(&self, call_id: &str) -> Vec<u16> {
        let mut inner = self.lock();
        let ports: Vec<u16> = inner
            .leases
            .values()
            .filter(|l| l.call_id == call_id)
            .map(|l| l.port)
            .collect();
        for port in &ports {
            inner.leases.remove(port);
            inner.available.insert(*port);
        }
        if !ports.is_empty() {
            debug!(call_id, ?ports, "released ports for call");
        }
        ports
    }

    /// Reclaim a lease regardless of owner.
    pub fn force_release(&self, port: u16) -> Option<PortLease> {
        let mut inner = self.lock();
        let lease = inner.leases.remove(&port)?;
        inner.available.insert(port);
        warn!(port, call_id = lease.call_id, "lease force-released");
        Some(lease)
    }

    pub fn lease(&self, port: u16) -> Option<PortLease> {
        self.lock().leases.get(&port).cloned()
    }

    pub fn leases_for(&self, call_id: &str) -> Vec<PortLease> {
        self.lock()
            .leases
            .values()
            .filter(|l| l.call_id == call_id)
            .cloned()
            .collect()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().leases.contains_key(&port)
    }

    pub fn stats(&self) -> PortPoolStats {
        let inner = self.lock();
        PortPoolStats {
            total_ports: inner.available.len() + inner.leases.len(),
            leased_ports: inner.leases.len(),
            available_ports: inner.available.len(),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start_port, self.end_port)
    }

    pub fn stale_leases(&self, threshold: Duration) -> Vec<PortLease> {
        self.lock()
            .leases
            .values()
            .filter(|l| l.acquired.elapsed() >= threshold)
            .cloned()
            .collect()
    }

    /// Periodically report leases older than `threshold`. Stale leases are
    /// only reported; reclaiming them takes an explicit `force_release`.
    pub fn spawn_health_check(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        threshold: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for lease in pool.stale_leases(threshold) {
                            warn!(
                                port = lease.port,
                                call_id = lease.call_id,
                                kind = ?lease.kind,
                                leased_at = %lease.leased_at,
                                age_secs = lease.acquired.elapsed().as_secs(),
                                "stale port lease"
                            );
                        }
                        let stats = pool.stats();
                        debug!(
                            leased = stats.leased_ports,
                            available = stats.available_ports,
                            "port pool health"
                        );
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
