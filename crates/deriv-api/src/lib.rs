//! # deriv-api
//!
//! Correlated request/response and subscription engine for the Deriv
//! WebSocket API.
//!
//! - [`DerivApi`]: the facade (`send`, `subscribe`, `forget`, `forget_all`,
//!   `expect_response`, `cached`, `errors`, `events`, `add_task`,
//!   `disconnect`, `clear`)
//! - [`dispatcher`]: the single reader loop and its routing order
//! - [`subscription`]: dedup, reuse by derived key, multicast streams
//! - [`cache`]: last-seen response per message type
//! - [`transport`]: the socket seam, implemented by [`WsTransport`] and the
//!   scripted [`MockTransport`]
//!
//! All inbound routing happens on one task per connection, so deciding
//! what a first response means is never raced by a second message.

#![deny(unsafe_code)]

pub mod api;
pub mod cache;
pub mod channels;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod mock;
pub mod subscription;
pub mod tasks;
pub mod transport;
pub mod ws;

pub use api::{CLEAR_REASON, DISCONNECT_REASON, DerivApi};
pub use cache::{ResponseCache, ResponseFuture};
pub use channels::{ApiEvent, Broadcast};
pub use config::EngineConfig;
pub use mock::MockTransport;
pub use subscription::{
    ContractReusePolicy, NoSecondaryKeys, SecondaryKeyPolicy, StreamItem, Subscription,
};
pub use transport::Transport;
pub use ws::WsTransport;

pub use deriv_core::{ApiError, ClosureCause, CloseOrigin, ResponseError, Result, SubscriptionId};
