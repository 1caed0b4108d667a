//! Correlation-id allocation and pending-call bookkeeping.
//!
//! Every non-stream call registers a single-use slot keyed by its correlation
//! id. The dispatcher takes the slot out of the map when the matching reply
//! arrives; resolving consumes it, so a call is resolved at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use deriv_core::{ApiError, ClosureCause, ReqId, Result};

/// Sending half of a pending call, owned by the correlator until resolved.
#[derive(Debug)]
pub struct PendingSlot(oneshot::Sender<Result<Value>>);

impl PendingSlot {
    /// Resolve the call. Returns `false` if the caller stopped waiting.
    pub fn resolve(self, outcome: Result<Value>) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Receiving half of a pending call, owned by the caller.
#[derive(Debug)]
pub struct PendingCall {
    id: ReqId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Correlation id of this call.
    pub fn id(&self) -> ReqId {
        self.id
    }

    /// Suspend until the dispatcher resolves the call.
    pub async fn wait(self) -> Result<Value> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ApiError::Api(format!("call {} abandoned", self.id))))
    }
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<ReqId, PendingSlot>,
    closed: Option<ClosureCause>,
}

/// Allocates correlation ids and tracks in-flight calls.
pub struct Correlator {
    next_id: AtomicU64,
    state: Mutex<Pending>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create a correlator whose first id is `1`.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(Pending::default()),
        }
    }

    /// Allocate the next id and register a waiter for it.
    ///
    /// Fails with the recorded closure cause once the connection has failed.
    pub fn register(&self) -> Result<PendingCall> {
        let mut state = self.state.lock();
        if let Some(cause) = &state.closed {
            return Err(cause.clone().into());
        }
        let id = ReqId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let _ = state.waiters.insert(id, PendingSlot(tx));
        Ok(PendingCall { id, rx })
    }

    /// Remove the waiter for `id`, handing its slot to the caller.
    pub fn take(&self, id: ReqId) -> Option<PendingSlot> {
        self.state.lock().waiters.remove(&id)
    }

    /// Drop the waiter for `id` without resolving it.
    pub fn cancel(&self, id: ReqId) {
        let _ = self.take(id);
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Refuse new calls and fail every pending one.
    ///
    /// The first cause recorded wins; later calls only drain. Returns the
    /// number of calls that were failed.
    pub fn close(&self, cause: &ClosureCause) -> usize {
        let (recorded, drained) = {
            let mut state = self.state.lock();
            let recorded = state.closed.get_or_insert_with(|| cause.clone()).clone();
            let drained: Vec<PendingSlot> = state.waiters.drain().map(|(_, slot)| slot).collect();
            (recorded, drained)
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.resolve(Err(recorded.clone().into()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn ids_strictly_increase() {
        let correlator = Correlator::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| correlator.register().unwrap().id().get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(correlator.pending(), 5);
    }

    #[tokio::test]
    async fn take_resolves_exactly_once() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        let id = call.id();

        let slot = correlator.take(id).unwrap();
        assert!(correlator.take(id).is_none());
        assert!(slot.resolve(Ok(json!({"pong": 1}))));

        assert_eq!(call.wait().await.unwrap(), json!({"pong": 1}));
    }

    #[tokio::test]
    async fn close_fails_pending_and_refuses_new_calls() {
        let correlator = Correlator::new();
        let a = correlator.register().unwrap();
        let b = correlator.register().unwrap();

        let cause = ClosureCause::remote(1234, "Closed by remote");
        assert_eq!(correlator.close(&cause), 2);
        assert_eq!(correlator.pending(), 0);

        assert_matches!(a.wait().await, Err(ApiError::Connection(c)) if c == cause);
        assert_matches!(b.wait().await, Err(ApiError::Connection(_)));
        assert_matches!(correlator.register(), Err(ApiError::Connection(c)) if c == cause);
    }

    #[test]
    fn first_closure_cause_is_kept() {
        let correlator = Correlator::new();
        let _ = correlator.close(&ClosureCause::local(1000, "Closed by disconnect"));
        let _ = correlator.close(&ClosureCause::remote(1006, "dropped"));
        assert_matches!(
            correlator.register(),
            Err(ApiError::Connection(c)) if c.reason == "Closed by disconnect"
        );
    }

    #[tokio::test]
    async fn cancel_abandons_call() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        correlator.cancel(call.id());
        assert_matches!(call.wait().await, Err(ApiError::Api(_)));
    }
}
