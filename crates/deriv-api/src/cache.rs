//! Last-seen response per message type.
//!
//! Every inbound message carrying a `msg_type` overwrites the entry for that
//! type, whatever its routing outcome or error status. Type waiters are
//! single-use: the next message of the type resolves them and they are gone.

use std::collections::HashMap;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use deriv_core::{ApiError, ClosureCause, Result};

/// Future returned by [`ResponseCache::expect`].
pub type ResponseFuture = BoxFuture<'static, Result<Value>>;

type TypeWaiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct CacheState {
    latest: HashMap<String, Value>,
    waiters: HashMap<String, Vec<TypeWaiter>>,
    closed: Option<ClosureCause>,
}

/// Message-type keyed response cache.
#[derive(Default)]
pub struct ResponseCache {
    state: Mutex<CacheState>,
}

impl ResponseCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent message of `msg_type`, if any.
    pub fn get(&self, msg_type: &str) -> Option<Value> {
        self.state.lock().latest.get(msg_type).cloned()
    }

    /// Store `msg` as the latest of `msg_type` and wake its waiters.
    pub fn record(&self, msg_type: &str, msg: &Value) {
        let waiters = {
            let mut state = self.state.lock();
            let _ = state.latest.insert(msg_type.to_string(), msg.clone());
            state.waiters.remove(msg_type).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(msg.clone()));
        }
    }

    /// Resolve with the cached message of `msg_type`, or the next one to arrive.
    ///
    /// The waiter is registered before this returns, so a message that
    /// arrives between the call and the first poll is not missed.
    pub fn expect(&self, msg_type: &str) -> ResponseFuture {
        let rx = {
            let mut state = self.state.lock();
            if let Some(hit) = state.latest.get(msg_type) {
                return futures::future::ready(Ok(hit.clone())).boxed();
            }
            if let Some(cause) = &state.closed {
                return futures::future::ready(Err(cause.clone().into())).boxed();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(msg_type.to_string()).or_default().push(tx);
            rx
        };
        let msg_type = msg_type.to_string();
        async move {
            rx.await
                .unwrap_or_else(|_| Err(ApiError::Api(format!("wait for {msg_type} abandoned"))))
        }
        .boxed()
    }

    /// Serve `msg_type` from the cache, or run `fetch` on a miss.
    ///
    /// `fetch` is expected to populate the cache through normal dispatch.
    pub async fn get_or_fetch<F, Fut>(&self, msg_type: &str, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(hit) = self.get(msg_type) {
            return Ok(hit);
        }
        fetch().await
    }

    /// Fail every type waiter and refuse new ones that miss the cache.
    pub fn close(&self, cause: &ClosureCause) {
        let (recorded, waiters) = {
            let mut state = self.state.lock();
            let recorded = state.closed.get_or_insert_with(|| cause.clone()).clone();
            let waiters: Vec<TypeWaiter> = state.waiters.drain().flat_map(|(_, w)| w).collect();
            (recorded, waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(recorded.clone().into()));
        }
    }

    /// Drop every cached message.
    pub fn clear(&self) {
        self.state.lock().latest.clear();
    }
}
