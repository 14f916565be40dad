//! Upstream firehose connection
//!
//! A [`FirehoseConnector`] opens one connection from an optional cursor and
//! yields raw binary frames in arrival order. The [`StreamReader`] owns the
//! reconnect loop and the resume cursor, and hands each frame to the relay
//! queue or straight to the pool.

mod reader;
mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use self::{
  reader::{FrameSink, StreamReader},
  websocket::WebSocketConnector,
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
  #[error("failed to connect to {url}: {source}")]
  Connect {
    url: String,
    #[source]
    source: Box<tokio_tungstenite::tungstenite::Error>,
  },
  #[error("websocket: {0}")]
  WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),
  #[error("upstream sent error {error}: {}", .message.as_deref().unwrap_or("no message"))]
  Upstream { error: String, message: Option<String> },
  #[error("no frame received for {0:?}")]
  IdleTimeout(Duration),
  #[error("stream closed by upstream")]
  Closed,
}

/// Raw frames from one connection. Ends or errors when the connection drops.
pub type FrameStream = BoxStream<'static, Result<Bytes, ConnectionError>>;

#[async_trait]
pub trait FirehoseConnector: Send + Sync {
  /// Open a subscription. `None` starts from the live tip.
  async fn connect(&self, cursor: Option<i64>) -> Result<FrameStream, ConnectionError>;
}
