//! Wire-format vocabulary: reserved fields, field accessors, canonical keys.
//!
//! Outbound requests and inbound responses are JSON objects. A handful of
//! top-level fields carry protocol meaning; everything else is payload.

use std::fmt::{self, Write as _};

use serde_json::{Map, Value};

use crate::ids::{ReqId, SubscriptionId};

/// Outbound request payload.
pub type Request = Map<String, Value>;

/// Correlation id field, set on requests and echoed on responses.
pub const REQ_ID: &str = "req_id";
/// Stream toggle field; `1` marks a stream-establishing call.
pub const SUBSCRIBE: &str = "subscribe";
/// Inbound message-type discriminator.
pub const MSG_TYPE: &str = "msg_type";
/// Inbound application error object `{code, message}`.
pub const ERROR: &str = "error";
/// Inbound subscription object `{id}`.
pub const SUBSCRIPTION: &str = "subscription";
/// Inbound echo of the originating request.
pub const ECHO_REQ: &str = "echo_req";
/// Unsubscribe call.
pub const FORGET: &str = "forget";
/// Passthrough field, echoed verbatim by the server.
pub const PASSTHROUGH: &str = "passthrough";

/// Call names that can establish a stream, in lookup priority order.
///
/// Used to work out which call a request represents when it carries
/// several top-level arguments (e.g. `contract_id` next to
/// `proposal_open_contract`).
pub const STREAM_CATEGORIES: &[&str] = &[
    "balance",
    "buy",
    "candles",
    "cashier_payments",
    "exchange_rates",
    "p2p_advert_info",
    "p2p_advertiser_create",
    "p2p_advertiser_info",
    "p2p_order_create",
    "p2p_order_info",
    "p2p_order_list",
    "proposal",
    "proposal_array",
    "proposal_open_contract",
    "ticks",
    "ticks_history",
    "transaction",
    "website_status",
];

const RESERVED_REQUEST_FIELDS: &[&str] = &[REQ_ID, SUBSCRIBE, PASSTHROUGH];

/// Echoed correlation id of an inbound message.
pub fn req_id(msg: &Value) -> Option<ReqId> {
    msg.get(REQ_ID).and_then(Value::as_u64).map(ReqId::new)
}

/// Message-type discriminator of an inbound message.
pub fn msg_type(msg: &Value) -> Option<&str> {
    msg.get(MSG_TYPE).and_then(Value::as_str)
}

/// Subscription id carried by an inbound message.
pub fn subscription_id(msg: &Value) -> Option<SubscriptionId> {
    msg.get(SUBSCRIPTION)
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(SubscriptionId::from)
}

/// Whether an inbound message carries an application error object.
pub fn has_error(msg: &Value) -> bool {
    msg.get(ERROR).is_some_and(|e| !e.is_null())
}

/// The call a request represents.
///
/// The first streamable call name present wins; otherwise the first
/// non-reserved field (in key order).
pub fn request_category(req: &Request) -> Option<&str> {
    STREAM_CATEGORIES
        .iter()
        .copied()
        .find(|name| req.contains_key(*name))
        .or_else(|| {
            req.keys()
                .map(String::as_str)
                .find(|k| !RESERVED_REQUEST_FIELDS.contains(k))
        })
}

/// Normalized request fingerprint.
///
/// Object keys are emitted in sorted order at every depth; the top-level
/// `req_id` and `subscribe` fields are dropped. Two requests that differ
/// only in field order or in those two fields produce the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Fingerprint a request.
    pub fn of(req: &Request) -> Self {
        let mut out = String::new();
        write_object(req, &[REQ_ID, SUBSCRIBE], &mut out);
        Self(out)
    }

    /// Return the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_object(map: &Map<String, Value>, skip: &[&str], out: &mut String) {
    let mut keys: Vec<&String> = map.keys().filter(|k| !skip.contains(&k.as_str())).collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}:", Value::String(key.clone()));
        write_value(&map[key], out);
    }
    out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, &[], out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
