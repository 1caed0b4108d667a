//! # deriv-core
//!
//! Shared vocabulary for the Deriv API client crates:
//!
//! - **Branded IDs**: [`ReqId`] (correlation id) and [`SubscriptionId`]
//! - **Errors**: [`ApiError`] taxonomy, [`ResponseError`], [`ClosureCause`]
//! - **Wire helpers**: reserved field names, [`CanonicalKey`], request categories
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod wire;

pub use errors::{ApiError, CloseOrigin, ClosureCause, ResponseError, Result};
pub use ids::{ReqId, SubscriptionId};
pub use wire::{CanonicalKey, Request};
