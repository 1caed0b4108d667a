//! Scripted in-memory transport for tests.
//!
//! Requests are matched against scripted responses by canonical key; the
//! response is stamped with the request's `req_id` and `echo_req` and queued
//! for the reader. `forget` requests are answered automatically, reporting
//! whether the id was handed out by a scripted or pushed message.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use deriv_core::{ApiError, CanonicalKey, ClosureCause, Result, wire};

use crate::transport::Transport;

type Frame = std::result::Result<String, ClosureCause>;

#[derive(Default)]
struct MockState {
    sent: Vec<Value>,
    scripted: HashMap<CanonicalKey, VecDeque<Value>>,
    active_subs: HashSet<String>,
    closed: bool,
    fail_sends: bool,
}

/// A transport that never touches the network.
pub struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock with nothing scripted.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Answer requests equivalent to `request` with `response`.
    ///
    /// Responses for the same request are used in order; the last one is
    /// repeated once the others are used up.
    pub fn respond_to(&self, request: Value, response: Value) {
        let Some(request) = request.as_object() else {
            return;
        };
        self.state
            .lock()
            .scripted
            .entry(CanonicalKey::of(request))
            .or_default()
            .push_back(response);
    }

    /// Queue an unsolicited inbound message.
    pub fn push(&self, msg: Value) {
        if let Some(sub_id) = wire::subscription_id(&msg) {
            let _ = self.state.lock().active_subs.insert(sub_id.into_inner());
        }
        self.push_raw(msg.to_string());
    }

    /// Queue an inbound frame verbatim.
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.inbound_tx.send(Ok(text.into()));
    }

    /// Close the connection as if the server did.
    pub fn close_remote(&self, code: u16, reason: &str) {
        self.state.lock().closed = true;
        let _ = self.inbound_tx.send(Err(ClosureCause::remote(code, reason)));
    }

    /// Make every following `send` fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Every request transmitted so far, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.state.lock().sent.clone()
    }

    /// Number of requests transmitted so far.
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    fn reply_to(state: &mut MockState, request: &Value) -> Option<Value> {
        let req_id = request.get(wire::REQ_ID).cloned();
        let mut echo = request.clone();
        if let Some(echo) = echo.as_object_mut() {
            let _ = echo.remove(wire::REQ_ID);
        }

        if let Some(sub_id) = request.get(wire::FORGET).and_then(Value::as_str) {
            let found = state.active_subs.remove(sub_id);
            return Some(serde_json::json!({
                "echo_req": echo,
                "forget": u8::from(found),
                "msg_type": "forget",
                "req_id": req_id,
            }));
        }

        let key = CanonicalKey::of(request.as_object()?);
        let queue = state.scripted.get_mut(&key)?;
        let mut response = if queue.len() > 1 {
            queue.pop_front()?
        } else {
            queue.front()?.clone()
        };
        if let Some(sub_id) = wire::subscription_id(&response) {
            let _ = state.active_subs.insert(sub_id.into_inner());
        }
        if let Some(fields) = response.as_object_mut() {
            let _ = fields.entry(wire::ECHO_REQ).or_insert(echo);
            if let Some(req_id) = req_id {
                let _ = fields.insert(wire::REQ_ID.to_string(), req_id);
            }
        }
        Some(response)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: String) -> Result<()> {
        let reply = {
            let mut state = self.state.lock();
            if state.fail_sends {
                return Err(ApiError::Transport("scripted send failure".into()));
            }
            if state.closed {
                return Err(ClosureCause::local(ClosureCause::NORMAL, "transport closed").into());
            }
            let request: Value = serde_json::from_str(&text)
                .map_err(|e| ApiError::Transport(format!("mock received invalid JSON: {e}")))?;
            let reply = Self::reply_to(&mut state, &request);
            state.sent.push(request);
            reply
        };
        if let Some(reply) = reply {
            let _ = self.inbound_tx.send(Ok(reply.to_string()));
        }
        Ok(())
    }

    async fn recv(&self) -> std::result::Result<String, ClosureCause> {
        self.inbound_rx.lock().await.recv().await.unwrap_or_else(|| {
            Err(ClosureCause::local(ClosureCause::ABNORMAL, "mock transport dropped"))
        })
    }

    async fn close(&self) {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if first {
            let _ = self
                .inbound_tx
                .send(Err(ClosureCause::local(ClosureCause::NORMAL, "closed by client")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_response_is_stamped() {
        let mock = MockTransport::new();
        mock.respond_to(json!({"ping": 1}), json!({"ping": "pong", "msg_type": "ping"}));

        mock.send(json!({"ping": 1, "req_id": 4}).to_string()).await.unwrap();
        let reply: Value = serde_json::from_str(&mock.recv().await.unwrap()).unwrap();
        assert_eq!(reply["req_id"], 4);
        assert_eq!(reply["echo_req"], json!({"ping": 1}));
        assert_eq!(mock.sent_count(), 1);
    }

    #[tokio::test]
    async fn forget_reports_known_ids() {
        let mock = MockTransport::new();
        mock.push(json!({"subscription": {"id": "A1"}}));
        let _ = mock.recv().await.unwrap();

        mock.send(json!({"forget": "A1", "req_id": 1}).to_string()).await.unwrap();
        mock.send(json!({"forget": "A1", "req_id": 2}).to_string()).await.unwrap();
        let first: Value = serde_json::from_str(&mock.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&mock.recv().await.unwrap()).unwrap();
        assert_eq!(first["forget"], 1);
        assert_eq!(second["forget"], 0);
    }

    #[tokio::test]
    async fn close_is_reported_once_and_blocks_sends() {
        let mock = MockTransport::new();
        mock.close().await;
        mock.close().await;
        let cause = mock.recv().await.unwrap_err();
        assert!(cause.is_local());
        assert!(mock.send("{}".into()).await.is_err());
    }
}
