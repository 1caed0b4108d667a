//! The single inbound reader.
//!
//! Every message goes through the same steps, in this order:
//!
//! 1. Record it in the response cache under its `msg_type` (this also wakes
//!    type waiters), and emit [`ApiEvent::Message`].
//! 2. If its `req_id` matches a pending call, resolve that call. When the
//!    call established a subscription, the subscription manager records the
//!    first response first. A message with an error and no subscription id
//!    resolves the call with a [`ResponseError`]; anything else resolves it
//!    with the message.
//! 3. Else, if its subscription id belongs to a live stream, publish it there.
//! 4. Else it is unroutable. With a subscription id, a background `forget`
//!    cleans up the stray server-side subscription. Without one, an
//!    `Extra response` error goes to the error channel.
//!
//! Cache recording always precedes resolution, so a caller resolved in step
//! 2 can observe its own response through the cache.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deriv_core::{ApiError, ResponseError, wire};

use crate::api::Inner;
use crate::channels::ApiEvent;
use crate::transport::Transport;

/// Read until the transport fails, `cancel` fires, or the engine is dropped.
pub(crate) async fn run(inner: Weak<Inner>, transport: Arc<dyn Transport>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                debug!("reader cancelled");
                return;
            }
            frame = transport.recv() => frame,
        };
        let Some(inner) = inner.upgrade() else {
            debug!("engine dropped, reader exiting");
            return;
        };
        match frame {
            Ok(text) => dispatch(&inner, &text),
            Err(cause) => {
                info!(%cause, "transport closed");
                inner.errors.publish(ApiError::Connection(cause.clone()));
                inner.fail(cause);
                return;
            }
        }
    }
}

/// Route one inbound frame.
pub(crate) fn dispatch(inner: &Arc<Inner>, text: &str) {
    let msg = match serde_json::from_str::<Value>(text) {
        Ok(msg) if msg.is_object() => msg,
        Ok(other) => {
            warn!(kind = %json_kind(&other), "dropping non-object message");
            inner.errors.publish(ApiError::Api(format!(
                "malformed message: expected an object, got {}",
                json_kind(&other)
            )));
            return;
        }
        Err(e) => {
            warn!(error = %e, "dropping unparsable message");
            inner.errors.publish(ApiError::Api(format!("malformed message: {e}")));
            return;
        }
    };

    if let Some(msg_type) = wire::msg_type(&msg) {
        inner.cache.record(msg_type, &msg);
    }
    inner.events.publish(ApiEvent::Message(msg.clone()));

    if let Some(id) = wire::req_id(&msg) {
        if let Some(slot) = inner.correlator.take(id) {
            let _ = inner.subscriptions.first_response(id, &msg);
            let outcome = match ResponseError::from_response(&msg) {
                Some(err) if wire::subscription_id(&msg).is_none() => Err(err.into()),
                _ => Ok(msg),
            };
            if !slot.resolve(outcome) {
                debug!(req_id = %id, "caller stopped waiting");
            }
            return;
        }
    }

    let Some(sub_id) = wire::subscription_id(&msg) else {
        warn!(
            req_id = ?wire::req_id(&msg),
            msg_type = ?wire::msg_type(&msg),
            "extra response"
        );
        inner.errors.publish(ApiError::extra_response());
        return;
    };

    if inner.subscriptions.route(&sub_id, &msg) {
        return;
    }

    if !inner.subscriptions.mark_stray(&sub_id) {
        debug!(subscription = %sub_id, "stray subscription already being forgotten");
        return;
    }
    warn!(subscription = %sub_id, "message for unknown subscription, forgetting it");
    let engine = Arc::clone(inner);
    inner
        .tasks
        .spawn(format!("forget {sub_id}"), async move { engine.forget(&sub_id).await.map(|_| ()) });
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
