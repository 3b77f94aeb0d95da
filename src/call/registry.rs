use super::state::{CallRecord, CallState, CallStatus};
use crate::error::GatewayError;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct RegistryInner {
    calls: HashMap<String, CallRecord>,
    // alias -> canonical call id
    aliases: HashMap<String, String>,
}

/// Live calls keyed by canonical id, plus every alias that points at them.
#[derive(Default)]
pub struct CallRegistry {
    inner: Mutex<RegistryInner>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: CallRecord) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        let call_id = record.call_id().to_string();
        if inner.calls.contains_key(&call_id) || inner.aliases.contains_key(&call_id) {
            return Err(GatewayError::InvalidParams(format!(
                "call {} already exists",
                call_id
            )));
        }
        if let Some(carrier_id) = record.params.carrier_id.clone() {
            inner.aliases.insert(carrier_id, call_id.clone());
        }
        inner.calls.insert(call_id, record);
        Ok(())
    }

    /// Map any known id (canonical or alias) to the canonical call id.
    pub fn resolve(&self, id: &str) -> Option<String> {
        let inner = self.lock();
        if inner.calls.contains_key(id) {
            return Some(id.to_string());
        }
        inner
            .aliases
            .get(id)
            .filter(|canonical| inner.calls.contains_key(*canonical))
            .cloned()
    }

    pub fn add_alias(&self, alias: &str, call_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.calls.contains_key(call_id) || alias == call_id {
            return false;
        }
        inner.aliases.insert(alias.to_string(), call_id.to_string());
        true
    }

    /// Run `f` on the call, whatever its state.
    pub fn with_call<R>(&self, call_id: &str, f: impl FnOnce(&mut CallRecord) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner.calls.get_mut(call_id).map(f)
    }

    /// Run `f` only if the call exists and has not failed or begun cleanup.
    pub fn update_live(&self, call_id: &str, f: impl FnOnce(&mut CallRecord)) -> bool {
        let mut inner = self.lock();
        match inner.calls.get_mut(call_id) {
            Some(call) if call.state.is_live() => {
                f(call);
                true
            }
            _ => false,
        }
    }

    /// Move the call into `Cleanup` and return a snapshot of it. Returns
    /// `None` if the call is unknown or already being cleaned up.
    pub fn begin_cleanup(&self, call_id: &str) -> Option<CallRecord> {
        let mut inner = self.lock();
        let call = inner.calls.get_mut(call_id)?;
        if call.state == CallState::Cleanup {
            return None;
        }
        call.state = CallState::Cleanup;
        Some(call.clone())
    }

    pub fn remove(&self, call_id: &str) -> Option<CallRecord> {
        let mut inner = self.lock();
        let removed = inner.calls.remove(call_id);
        inner.aliases.retain(|_, canonical| canonical != call_id);
        removed
    }

    pub fn status(&self, id: &str) -> Option<CallStatus> {
        let canonical = self.resolve(id)?;
        self.lock().calls.get(&canonical).map(|c| c.status())
    }

    pub fn statuses(&self) -> Vec<CallStatus> {
        let mut statuses: Vec<_> = self.lock().calls.values().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        statuses
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.lock().calls.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().calls.is_empty()
    }
}
