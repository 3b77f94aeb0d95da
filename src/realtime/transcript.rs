use crate::conversation::Role;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Pending {
    text: String,
    updated_at: Option<Instant>,
}

impl Pending {
    fn push(&mut self, delta: &str, now: Instant) {
        self.text.push_str(delta);
        self.updated_at = Some(now);
    }

    fn replace(&mut self, text: &str, now: Instant) {
        self.text.clear();
        self.text.push_str(text);
        self.updated_at = Some(now);
    }

    fn take(&mut self) -> Option<String> {
        self.updated_at = None;
        let text = std::mem::take(&mut self.text);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        match self.updated_at {
            Some(at) => now.saturating_duration_since(at) >= threshold,
            None => false,
        }
    }
}

/// Caller and assistant transcripts for one call. The two sides fill
/// independently since the caller may talk over a response.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    user: Pending,
    assistant: Pending,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&mut self, role: Role) -> &mut Pending {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    pub fn push_delta(&mut self, role: Role, delta: &str, now: Instant) {
        self.side(role).push(delta, now);
    }

    /// A completed transcript supersedes the deltas gathered so far.
    pub fn complete(&mut self, role: Role, text: &str, now: Instant) {
        if text.trim().is_empty() {
            return;
        }
        self.side(role).replace(text, now);
    }

    pub fn take(&mut self, role: Role) -> Option<String> {
        self.side(role).take()
    }

    pub fn take_stale(&mut self, now: Instant, threshold: Duration) -> Vec<(Role, String)> {
        let mut out = Vec::new();
        for role in [Role::User, Role::Assistant] {
            if self.side(role).is_stale(now, threshold) {
                if let Some(text) = self.take(role) {
                    out.push((role, text));
                }
            }
        }
        out
    }

    pub fn take_all(&mut self) -> Vec<(Role, String)> {
        [Role::User, Role::Assistant]
            .into_iter()
            .filter_map(|role| self.take(role).map(|text| (role, text)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.user.text.is_empty() && self.assistant.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_accumulate_independently() {
        let mut acc = TranscriptAccumulator::new();
        let now = Instant::now();
        acc.push_delta(Role::Assistant, "Hello, ", now);
        acc.push_delta(Role::User, "wait", now);
        acc.push_delta(Role::Assistant, "how can I help?", now);

        assert_eq!(acc.take(Role::User).as_deref(), Some("wait"));
        assert_eq!(
            acc.take(Role::Assistant).as_deref(),
            Some("Hello, how can I help?")
        );
        assert!(acc.is_empty());
        assert_eq!(acc.take(Role::User), None);
    }

    #[test]
    fn test_completed_replaces_deltas() {
        let mut acc = TranscriptAccumulator::new();
        let now = Instant::now();
        acc.push_delta(Role::User, "helo wor", now);
        acc.complete(Role::User, "hello world", now);
        assert_eq!(acc.take(Role::User).as_deref(), Some("hello world"));

        acc.push_delta(Role::User, "kept", now);
        acc.complete(Role::User, "  ", now);
        assert_eq!(acc.take(Role::User).as_deref(), Some("kept"));
    }

    #[test]
    fn test_stale_sweep() {
        let mut acc = TranscriptAccumulator::new();
        let start = Instant::now();
        acc.push_delta(Role::User, "old", start);
        acc.push_delta(Role::Assistant, "fresh", start + Duration::from_secs(4));

        let stale = acc.take_stale(start + Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(stale, vec![(Role::User, "old".to_string())]);

        let rest = acc.take_all();
        assert_eq!(rest, vec![(Role::Assistant, "fresh".to_string())]);
    }

    #[test]
    fn test_whitespace_only_is_dropped() {
        let mut acc = TranscriptAccumulator::new();
        acc.push_delta(Role::Assistant, "   ", Instant::now());
        assert!(acc.take_all().is_empty());
    }
}
