//! Branded ID newtypes.
//!
//! Correlation ids are allocated locally and are plain integers on the wire.
//! Subscription ids are assigned by the server and are opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation id stamped into every outbound request under `req_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReqId(u64);

impl ReqId {
    /// Wrap a raw correlation id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw integer value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReqId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Server-assigned subscription id (`subscription.id` on the wire).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::ops::Deref for SubscriptionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_id_orders_numerically() {
        assert!(ReqId::new(2) < ReqId::new(10));
        assert_eq!(ReqId::from(7).get(), 7);
        assert_eq!(ReqId::new(42).to_string(), "42");
    }

    #[test]
    fn req_id_serializes_as_integer() {
        let json = serde_json::to_value(ReqId::new(3)).unwrap();
        assert_eq!(json, serde_json::json!(3));
    }

    #[test]
    fn subscription_id_is_transparent() {
        let id = SubscriptionId::from("A11111");
        assert_eq!(id.as_str(), "A11111");
        assert_eq!(&*id, "A11111");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""A11111""#);
        let back: SubscriptionId = serde_json::from_str(r#""B2""#).unwrap();
        assert_eq!(back.into_inner(), "B2");
    }
}
