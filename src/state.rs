use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::HtnnStreamDelta;

/// Everything the filter needs to carry from `decode_request` through to
/// `encode_response`/`encode_data` for one request attempt: the predicted
/// debit, the rate-limit keys it was charged against, the prompt token
/// count, and (stream path only) the in-progress delta accumulator.
///
/// A gateway host normally provides this kind of request-scoped scratchpad
/// as part of its filter-chain runtime; this standalone harness owns a
/// `Mutex<HashMap>` to stand in for it.
#[derive(Clone, Default)]
pub struct PerRequestState {
    pub predicted: u64,
    pub keys: Vec<String>,
    pub prompt_token: u64,
    pub stream_delta: Option<HtnnStreamDelta>,
}

struct Entry {
    state: PerRequestState,
    created_at: Instant,
}

/// Shared per-request scratchpad keyed by request ID. There is no cleanup
/// hook for streams the client aborts mid-flight, so a coarse TTL sweep
/// keeps a long-running process from leaking entries unboundedly; the
/// happy path still clears its own entry on completion.
pub struct RequestStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl RequestStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn set(&self, req_id: &str, state: PerRequestState) {
        let mut entries = self.entries.lock().expect("request state mutex poisoned");
        entries.insert(
            req_id.to_string(),
            Entry {
                state,
                created_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, req_id: &str) -> Option<PerRequestState> {
        let entries = self.entries.lock().expect("request state mutex poisoned");
        entries.get(req_id).map(|entry| entry.state.clone())
    }

    pub fn clear(&self, req_id: &str) {
        let mut entries = self.entries.lock().expect("request state mutex poisoned");
        entries.remove(req_id);
    }

    /// Evicts entries older than `ttl`. Intended to be called periodically
    /// from a background task standing in for host-side GC of abandoned
    /// per-request state (aborted streams never reach a terminal phase).
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("request state mutex poisoned");
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let store = RequestStateStore::new(Duration::from_secs(60));
        store.set(
            "req-1",
            PerRequestState {
                predicted: 42,
                ..Default::default()
            },
        );
        let loaded = store.get("req-1").unwrap();
        assert_eq!(loaded.predicted, 42);
    }

    #[test]
    fn clear_removes_entry() {
        let store = RequestStateStore::new(Duration::from_secs(60));
        store.set("req-1", PerRequestState::default());
        store.clear("req-1");
        assert!(store.get("req-1").is_none());
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let store = RequestStateStore::new(Duration::from_millis(1));
        store.set("req-1", PerRequestState::default());
        std::thread::sleep(Duration::from_millis(10));
        let evicted = store.sweep_expired();
        assert_eq!(evicted, 1);
        assert!(store.get("req-1").is_none());
    }
}
