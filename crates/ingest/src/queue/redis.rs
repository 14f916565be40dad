//! Redis Streams backend.
//!
//! One stream holds `{seq, data}` entries; one consumer group shares them out.
//!
//! - claim: `XAUTOCLAIM` (expired pending entries), then `XREADGROUP ... >`
//! - ack: `XACK` + `XDEL` so the stream length is the backlog
//! - depth: `XLEN`

use std::{sync::Arc, time::Duration};

use ::redis::{
  AsyncCommands, Client, RedisError,
  aio::ConnectionManager,
  streams::{StreamAutoClaimReply, StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply},
};
use async_trait::async_trait;
use bytes::Bytes;
use skyline_core::QueueConfig;
use tracing::{debug, info};

use super::{QueueEntry, QueueError, RelayQueue};

#[derive(Clone)]
pub struct RedisQueue {
  client: Client,
  conn: ConnectionManager,
  stream: String,
  group: String,
  claim_timeout: Duration,
  block: Duration,
}

impl RedisQueue {
  pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
    let client = Client::open(config.redis_url.as_str())?;
    let conn = client.get_connection_manager().await?;
    info!(url = %config.redis_url, stream = %config.stream_name, "Connected to relay queue");

    Ok(Self {
      client,
      conn,
      stream: config.stream_name.clone(),
      group: config.group_name.clone(),
      claim_timeout: config.claim_timeout(),
      block: config.block(),
    })
  }

  fn to_entry(&self, raw: StreamId, consumer: &str, reclaimed: bool) -> Result<QueueEntry, QueueError> {
    let sequence = raw.get::<i64>("seq").ok_or_else(|| QueueError::Malformed {
      id: raw.id.clone(),
      reason: "missing seq field",
    })?;
    let payload = raw.get::<Vec<u8>>("data").ok_or_else(|| QueueError::Malformed {
      id: raw.id.clone(),
      reason: "missing data field",
    })?;

    Ok(QueueEntry {
      id: raw.id,
      sequence,
      payload: Bytes::from(payload),
      owner: consumer.to_string(),
      reclaimed,
    })
  }

  async fn reclaim(&self, consumer: &str) -> Result<Option<StreamId>, RedisError> {
    let mut conn = self.conn.clone();
    let reply: StreamAutoClaimReply = ::redis::cmd("XAUTOCLAIM")
      .arg(&self.stream)
      .arg(&self.group)
      .arg(consumer)
      .arg(self.claim_timeout.as_millis() as u64)
      .arg("0-0")
      .arg("COUNT")
      .arg(1)
      .query_async(&mut conn)
      .await?;
    Ok(reply.claimed.into_iter().next())
  }

  async fn read_fresh(&self, consumer: &str) -> Result<Option<StreamId>, RedisError> {
    let mut conn = self.conn.clone();
    let options = StreamReadOptions::default()
      .group(&self.group, consumer)
      .count(1)
      .block(self.block.as_millis() as usize);
    let reply: Option<StreamReadReply> = conn.xread_options(&[&self.stream], &[">"], &options).await?;

    Ok(
      reply
        .and_then(|reply| reply.keys.into_iter().next())
        .and_then(|key| key.ids.into_iter().next()),
    )
  }
}

#[async_trait]
impl RelayQueue for RedisQueue {
  async fn ensure_group(&self) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let created: Result<(), RedisError> = ::redis::cmd("XGROUP")
      .arg("CREATE")
      .arg(&self.stream)
      .arg(&self.group)
      .arg("$")
      .arg("MKSTREAM")
      .query_async(&mut conn)
      .await;

    match created {
      Ok(()) => {
        info!(group = %self.group, "Created consumer group");
        Ok(())
      }
      Err(e) if e.code() == Some("BUSYGROUP") => {
        debug!(group = %self.group, "Consumer group already exists");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn append(&self, sequence: i64, payload: Bytes) -> Result<String, QueueError> {
    let mut conn = self.conn.clone();
    let id: String = ::redis::cmd("XADD")
      .arg(&self.stream)
      .arg("*")
      .arg("seq")
      .arg(sequence)
      .arg("data")
      .arg(payload.as_ref())
      .query_async(&mut conn)
      .await?;
    Ok(id)
  }

  async fn claim_next(&self, consumer: &str) -> Result<Option<QueueEntry>, QueueError> {
    if let Some(raw) = self.reclaim(consumer).await? {
      return self.to_entry(raw, consumer, true).map(Some);
    }

    match self.read_fresh(consumer).await? {
      Some(raw) => self.to_entry(raw, consumer, false).map(Some),
      None => Ok(None),
    }
  }

  async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    ::redis::pipe()
      .atomic()
      .cmd("XACK")
      .arg(&self.stream)
      .arg(&self.group)
      .arg(entry_id)
      .ignore()
      .cmd("XDEL")
      .arg(&self.stream)
      .arg(entry_id)
      .ignore()
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }

  async fn depth(&self) -> Result<u64, QueueError> {
    let mut conn = self.conn.clone();
    let len: u64 = conn.xlen(&self.stream).await?;
    Ok(len)
  }

  async fn oldest_sequence(&self) -> Result<Option<i64>, QueueError> {
    let mut conn = self.conn.clone();
    let reply: StreamRangeReply = conn.xrange_count(&self.stream, "-", "+", 1).await?;
    Ok(reply.ids.first().and_then(|entry| entry.get::<i64>("seq")))
  }

  async fn connect_consumer(&self) -> Result<Arc<dyn RelayQueue>, QueueError> {
    let conn = self.client.get_connection_manager().await?;
    Ok(Arc::new(Self {
      conn,
      ..self.clone()
    }))
  }
}
