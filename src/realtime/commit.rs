use crate::config::RealtimeConfig;
use std::time::{Duration, Instant};

/// Tuning for when appended audio gets committed.
#[derive(Debug, Clone)]
pub struct CommitPolicy {
    pub min_commit: Duration,
    pub safety_margin: Duration,
    pub fast_chunks: u32,
    pub fast_delay: Duration,
    pub steady_delay: Duration,
    pub bytes_per_ms: usize,
}

impl CommitPolicy {
    pub fn from_config(config: &RealtimeConfig, bytes_per_ms: usize) -> Self {
        Self {
            min_commit: Duration::from_millis(config.min_commit_ms),
            safety_margin: Duration::from_millis(config.commit_safety_margin_ms),
            fast_chunks: config.fast_commit_chunks,
            fast_delay: Duration::from_millis(config.fast_commit_delay_ms),
            steady_delay: Duration::from_millis(config.commit_delay_ms),
            bytes_per_ms: bytes_per_ms.max(1),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.min_commit + self.safety_margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Commit right away (barge-in with non-trivial audio).
    Now,
    /// Commit once this deadline passes without newer audio resetting it.
    At(Instant),
}

/// Local bookkeeping of audio appended since the last commit.
#[derive(Debug)]
pub struct CommitTracker {
    policy: CommitPolicy,
    bytes_since_commit: usize,
    chunks_in_turn: u32,
    deadline: Option<Instant>,
    last_commit: Option<Instant>,
    pending_ack: bool,
    commits: u64,
}

impl CommitTracker {
    pub fn new(policy: CommitPolicy) -> Self {
        Self {
            policy,
            bytes_since_commit: 0,
            chunks_in_turn: 0,
            deadline: None,
            last_commit: None,
            pending_ack: false,
            commits: 0,
        }
    }

    /// Record an appended chunk and decide when to commit. `barge_in` is
    /// true while a response is playing and the caller's audio is speech.
    pub fn on_append(&mut self, len: usize, now: Instant, barge_in: bool) -> CommitDecision {
        self.bytes_since_commit += len;
        self.chunks_in_turn += 1;
        if barge_in && self.can_commit() {
            self.deadline = None;
            return CommitDecision::Now;
        }
        let delay = if self.chunks_in_turn <= self.policy.fast_chunks {
            self.policy.fast_delay
        } else {
            self.policy.steady_delay
        };
        let deadline = now + delay;
        self.deadline = Some(deadline);
        CommitDecision::At(deadline)
    }

    pub fn buffered(&self) -> Duration {
        Duration::from_millis((self.bytes_since_commit / self.policy.bytes_per_ms) as u64)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes_since_commit
    }

    /// Whether enough audio is buffered for the backend to accept a commit.
    pub fn can_commit(&self) -> bool {
        self.bytes_since_commit > 0 && self.buffered() >= self.policy.threshold()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Called when the debounce deadline fires. Returns true if a commit
    /// should be sent now; otherwise keeps waiting for more audio.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.can_commit()
            }
            _ => false,
        }
    }

    pub fn mark_committed(&mut self, now: Instant) {
        self.bytes_since_commit = 0;
        self.chunks_in_turn = 0;
        self.deadline = None;
        self.last_commit = Some(now);
        self.pending_ack = true;
        self.commits += 1;
    }

    /// The backend acknowledged a commit (ours or one its own VAD made).
    pub fn on_committed(&mut self) {
        if self.pending_ack {
            self.pending_ack = false;
        } else {
            // server-side commit consumed what we had appended
            self.bytes_since_commit = 0;
            self.chunks_in_turn = 0;
            self.deadline = None;
        }
    }

    /// A new caller turn begins.
    pub fn start_turn(&mut self) {
        self.chunks_in_turn = 0;
    }

    /// Forget local state after the backend reported it holds less audio
    /// than we thought.
    pub fn reset(&mut self) {
        self.bytes_since_commit = 0;
        self.chunks_in_turn = 0;
        self.deadline = None;
        self.pending_ack = false;
    }

    pub fn pending_ack(&self) -> bool {
        self.pending_ack
    }

    pub fn last_commit(&self) -> Option<Instant> {
        self.last_commit
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}
