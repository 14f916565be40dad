//! WebSocket connector for `com.atproto.sync.subscribeRepos`.

use async_trait::async_trait;
use futures::StreamExt;
use skyline_core::FirehoseConfig;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace};

use super::{ConnectionError, FirehoseConnector, FrameStream};

const SUBSCRIBE_REPOS: &str = "/xrpc/com.atproto.sync.subscribeRepos";

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
  service: String,
}

impl WebSocketConnector {
  /// `service` may be given as `wss://`, `ws://`, `https://` or `http://`.
  pub fn new(service: impl Into<String>) -> Self {
    let service = service.into();
    let service = if let Some(rest) = service.strip_prefix("https://") {
      format!("wss://{rest}")
    } else if let Some(rest) = service.strip_prefix("http://") {
      format!("ws://{rest}")
    } else {
      service
    };
    Self {
      service: service.trim_end_matches('/').to_string(),
    }
  }

  pub fn from_config(config: &FirehoseConfig) -> Self {
    Self::new(config.service.clone())
  }

  pub fn url(&self, cursor: Option<i64>) -> String {
    match cursor {
      Some(cursor) => format!("{}{SUBSCRIBE_REPOS}?cursor={cursor}", self.service),
      None => format!("{}{SUBSCRIBE_REPOS}", self.service),
    }
  }
}

#[async_trait]
impl FirehoseConnector for WebSocketConnector {
  async fn connect(&self, cursor: Option<i64>) -> Result<FrameStream, ConnectionError> {
    let url = self.url(cursor);
    let (socket, response) = connect_async(url.as_str())
      .await
      .map_err(|e| ConnectionError::Connect {
        url: url.clone(),
        source: Box::new(e),
      })?;
    debug!(url = %url, status = %response.status(), "Firehose connected");

    // Reading drives the socket, which also answers pings
    let frames = socket.filter_map(|message| async move {
      match message {
        Ok(Message::Binary(data)) => Some(Ok(data)),
        Ok(Message::Close(frame)) => {
          trace!(?frame, "Firehose sent close");
          Some(Err(ConnectionError::Closed))
        }
        Ok(_) => None,
        Err(e) => Some(Err(ConnectionError::WebSocket(Box::new(e)))),
      }
    });
    Ok(frames.boxed())
  }
}
