//! WebSocket transport over `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use deriv_core::{ApiError, ClosureCause, Result};

use crate::transport::Transport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single WebSocket connection.
pub struct WsTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed_locally: AtomicBool,
}

impl WsTransport {
    /// Open a WebSocket connection to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ApiError::Transport(format!("WebSocket connect: {e}")))?;
        info!(url, "connected");
        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed_locally: AtomicBool::new(false),
        })
    }

    fn closure(&self, code: u16, reason: impl Into<String>) -> ClosureCause {
        if self.closed_locally.load(Ordering::Acquire) {
            ClosureCause::local(code, reason)
        } else {
            ClosureCause::remote(code, reason)
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    async fn recv(&self) -> std::result::Result<String, ClosureCause> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(text) = String::from_utf8(data.to_vec()) {
                        return Ok(text);
                    }
                    debug!(len = data.len(), "dropping non-UTF8 binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(match frame {
                        Some(frame) => self.closure(u16::from(frame.code), frame.reason.as_str()),
                        None => self.closure(ClosureCause::NORMAL, "closed without reason"),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(self.closure(ClosureCause::ABNORMAL, e.to_string())),
                None => return Err(self.closure(ClosureCause::ABNORMAL, "connection dropped")),
            }
        }
    }

    async fn close(&self) {
        self.closed_locally.store(true, Ordering::Release);
        let _ = self.sink.lock().await.close().await;
    }
}
