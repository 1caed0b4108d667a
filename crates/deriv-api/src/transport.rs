//! Transport seam: a bidirectional text-message channel that owns the socket.

use async_trait::async_trait;
use deriv_core::{ClosureCause, Result};

/// Full-duplex text transport consumed by the engine.
///
/// The engine calls [`recv`](Transport::recv) from exactly one task and
/// [`send`](Transport::send) from any number of callers concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transmit one serialized message.
    ///
    /// Fails with [`ApiError::Transport`](deriv_core::ApiError::Transport) or
    /// [`ApiError::Connection`](deriv_core::ApiError::Connection).
    async fn send(&self, text: String) -> Result<()>;

    /// Wait for the next inbound message.
    ///
    /// An `Err` is terminal: the connection is gone and the engine stops
    /// reading.
    async fn recv(&self) -> std::result::Result<String, ClosureCause>;

    /// Close the connection from this side.
    async fn close(&self);
}
