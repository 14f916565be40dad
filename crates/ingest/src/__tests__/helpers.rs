//! Test helpers shared by unit and integration tests.
//!
//! - `FrameBuilder` / `Op`: encode firehose frames the way a relay does
//! - `RecordingIndex`: indexing service that records every call
//! - `FaultyFactory`: memory index that panics or fails once on a chosen record
//! - `ScriptedConnector`: firehose connector replaying canned sessions
//! - `ErrorLog`: error handler collecting reported errors

use std::{
  collections::VecDeque,
  future::Future,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use minicbor::Encoder;
use serde_json::Value;
use skyline_core::{IndexingConfig, WorkerConfig};

use crate::{
  error::{ErrorHandler, IngestError},
  event::{AcceptAll, codec::Cid},
  indexing::{IndexError, IndexingFactory, IndexingService, MemoryIndex, WriteAction},
  stream::{ConnectionError, FirehoseConnector, FrameStream},
  telemetry::Watermarks,
  worker::{Transport, WorkerContext},
};

// ============================================================================
// CIDs, blocks and CAR files
// ============================================================================

pub const TIME: &str = "2024-05-01T12:00:00.000Z";

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

/// Deterministic dag-cbor/sha2-256 CIDv1 whose digest is `n` repeated.
pub fn fake_cid(n: u8) -> Cid {
  let mut bytes = vec![0x01, 0x71, 0x12, 0x20];
  bytes.extend_from_slice(&[n; 32]);
  Cid::read_prefix(&bytes).unwrap().0
}

fn link(enc: &mut Enc<'_>, cid: &Cid) {
  enc.writer_mut().extend_from_slice(&[0xd8, 0x2a]);
  let mut raw = vec![0x00];
  raw.extend_from_slice(cid.as_bytes());
  enc.bytes(&raw).unwrap();
}

fn push_varint(out: &mut Vec<u8>, mut value: u64) {
  loop {
    let byte = (value & 0x7f) as u8;
    value >>= 7;
    if value == 0 {
      out.push(byte);
      return;
    }
    out.push(byte | 0x80);
  }
}

/// DAG-CBOR record body `{$type, text, createdAt}`.
pub fn record_block(record_type: &str, text: &str) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut enc = Encoder::new(&mut buf);
  enc.map(3).unwrap();
  enc.str("$type").unwrap().str(record_type).unwrap();
  enc.str("createdAt").unwrap().str(TIME).unwrap();
  enc.str("text").unwrap().str(text).unwrap();
  buf
}

/// CAR v1 with one root and the given blocks.
pub fn build_car(root: &Cid, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
  let mut header = Vec::new();
  let mut enc = Encoder::new(&mut header);
  enc.map(2).unwrap();
  enc.str("roots").unwrap().array(1).unwrap();
  link(&mut enc, root);
  enc.str("version").unwrap().u64(1).unwrap();

  let mut out = Vec::new();
  push_varint(&mut out, header.len() as u64);
  out.extend_from_slice(&header);
  for (cid, block) in blocks {
    push_varint(&mut out, (cid.as_bytes().len() + block.len()) as u64);
    out.extend_from_slice(cid.as_bytes());
    out.extend_from_slice(block);
  }
  out
}

// ============================================================================
// Frames
// ============================================================================

/// Header `{op, t}` followed by a body written by `body`.
fn frame(op: i64, t: Option<&str>, body: impl FnOnce(&mut Enc<'_>)) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut enc = Encoder::new(&mut buf);
  match t {
    Some(t) => {
      enc.map(2).unwrap();
      enc.str("op").unwrap().i64(op).unwrap();
      enc.str("t").unwrap().str(t).unwrap();
    }
    None => {
      enc.map(1).unwrap();
      enc.str("op").unwrap().i64(op).unwrap();
    }
  }
  body(&mut enc);
  buf
}

pub struct FrameBuilder;

impl FrameBuilder {
  pub const TIME: &'static str = TIME;

  pub fn commit(seq: i64, did: &str) -> CommitBuilder {
    CommitBuilder {
      seq,
      did: did.to_string(),
      ops: Vec::new(),
    }
  }

  /// Commit creating one post, `app.bsky.feed.post/<seq>`.
  pub fn post(seq: i64, did: &str) -> Vec<u8> {
    Self::commit(seq, did)
      .op(Op::create(format!("app.bsky.feed.post/{seq}"), format!("post {seq}")))
      .build()
  }

  pub fn identity(seq: i64, did: &str) -> Vec<u8> {
    frame(1, Some("#identity"), |enc| {
      enc.map(4).unwrap();
      enc.str("seq").unwrap().i64(seq).unwrap();
      enc.str("did").unwrap().str(did).unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
      enc.str("handle").unwrap().str("alice.test").unwrap();
    })
  }

  pub fn account(seq: i64, did: &str, active: bool, status: Option<&str>) -> Vec<u8> {
    frame(1, Some("#account"), |enc| {
      enc.map(if status.is_some() { 5 } else { 4 }).unwrap();
      enc.str("seq").unwrap().i64(seq).unwrap();
      enc.str("did").unwrap().str(did).unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
      enc.str("active").unwrap().bool(active).unwrap();
      if let Some(status) = status {
        enc.str("status").unwrap().str(status).unwrap();
      }
    })
  }

  pub fn account_without_active(seq: i64, did: &str) -> Vec<u8> {
    frame(1, Some("#account"), |enc| {
      enc.map(3).unwrap();
      enc.str("seq").unwrap().i64(seq).unwrap();
      enc.str("did").unwrap().str(did).unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
    })
  }

  pub fn sync(seq: i64, did: &str) -> Vec<u8> {
    let car = build_car(&fake_cid(2), &[]);
    frame(1, Some("#sync"), |enc| {
      enc.map(5).unwrap();
      enc.str("seq").unwrap().i64(seq).unwrap();
      enc.str("did").unwrap().str(did).unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
      enc.str("rev").unwrap().str("3ksync").unwrap();
      enc.str("blocks").unwrap().bytes(&car).unwrap();
    })
  }

  /// Frame of type `t` whose body only has `seq` and `time`.
  pub fn raw(t: &str, seq: i64) -> Vec<u8> {
    frame(1, Some(t), |enc| {
      enc.map(2).unwrap();
      enc.str("seq").unwrap().i64(seq).unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
    })
  }

  /// `#info` frame, which carries no sequence.
  pub fn info() -> Vec<u8> {
    frame(1, Some("#info"), |enc| {
      enc.map(1).unwrap();
      enc.str("name").unwrap().str("OutdatedCursor").unwrap();
    })
  }

  pub fn error_frame(error: &str, message: Option<&str>) -> Vec<u8> {
    frame(-1, None, |enc| {
      enc.map(if message.is_some() { 2 } else { 1 }).unwrap();
      enc.str("error").unwrap().str(error).unwrap();
      if let Some(message) = message {
        enc.str("message").unwrap().str(message).unwrap();
      }
    })
  }
}

pub struct Op {
  action: &'static str,
  path: String,
  text: String,
  with_block: bool,
}

impl Op {
  pub fn create(path: impl Into<String>, text: impl Into<String>) -> Self {
    Self {
      action: "create",
      path: path.into(),
      text: text.into(),
      with_block: true,
    }
  }

  pub fn update(path: impl Into<String>, text: impl Into<String>) -> Self {
    Self {
      action: "update",
      ..Self::create(path, text)
    }
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self {
      action: "delete",
      with_block: false,
      ..Self::create(path, "")
    }
  }

  /// Reference a record block the commit does not carry.
  pub fn without_block(mut self) -> Self {
    self.with_block = false;
    self
  }
}

pub struct CommitBuilder {
  seq: i64,
  did: String,
  ops: Vec<Op>,
}

impl CommitBuilder {
  pub fn op(mut self, op: Op) -> Self {
    self.ops.push(op);
    self
  }

  pub fn build(self) -> Vec<u8> {
    let commit = fake_cid(1);
    let cids: Vec<Option<Cid>> = self
      .ops
      .iter()
      .enumerate()
      .map(|(i, op)| (op.action != "delete").then(|| fake_cid(10 + i as u8)))
      .collect();

    let blocks: Vec<(Cid, Vec<u8>)> = self
      .ops
      .iter()
      .zip(&cids)
      .filter(|(op, _)| op.with_block)
      .filter_map(|(op, cid)| {
        let collection = op.path.split('/').next().unwrap_or_default();
        cid.clone().map(|cid| (cid, record_block(collection, &op.text)))
      })
      .collect();
    let car = build_car(&commit, &blocks);

    frame(1, Some("#commit"), |enc| {
      enc.map(7).unwrap();
      enc.str("seq").unwrap().i64(self.seq).unwrap();
      enc.str("repo").unwrap().str(&self.did).unwrap();
      enc.str("rev").unwrap().str("3kabc").unwrap();
      enc.str("time").unwrap().str(TIME).unwrap();
      enc.str("commit").unwrap();
      link(enc, &commit);
      enc.str("blocks").unwrap().bytes(&car).unwrap();
      enc.str("ops").unwrap().array(self.ops.len() as u64).unwrap();
      for (op, cid) in self.ops.iter().zip(&cids) {
        enc.map(3).unwrap();
        enc.str("action").unwrap().str(op.action).unwrap();
        enc.str("path").unwrap().str(&op.path).unwrap();
        enc.str("cid").unwrap();
        match cid {
          Some(cid) => link(enc, cid),
          None => {
            enc.null().unwrap();
          }
        }
      }
    })
  }
}

// ============================================================================
// Indexing services
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum IndexCall {
  IndexRecord(String, WriteAction),
  DeleteRecord(String),
  IndexHandle(String, bool),
  UpdateActorStatus(String, bool, Option<String>),
  DeleteActor(String),
  SetCommitLastSeen(String, Option<String>, String),
}

#[derive(Default)]
pub struct RecordingIndex {
  calls: Mutex<Vec<IndexCall>>,
}

impl RecordingIndex {
  pub fn calls(&self) -> Vec<IndexCall> {
    self.calls.lock().unwrap().clone()
  }

  fn push(&self, call: IndexCall) {
    self.calls.lock().unwrap().push(call);
  }
}

#[async_trait]
impl IndexingService for RecordingIndex {
  async fn index_record(
    &self,
    uri: &str,
    _cid: &str,
    _record: &Value,
    action: WriteAction,
    _time: &str,
  ) -> Result<(), IndexError> {
    self.push(IndexCall::IndexRecord(uri.to_string(), action));
    Ok(())
  }

  async fn delete_record(&self, uri: &str) -> Result<(), IndexError> {
    self.push(IndexCall::DeleteRecord(uri.to_string()));
    Ok(())
  }

  async fn index_handle(&self, did: &str, _time: &str, force: bool) -> Result<(), IndexError> {
    self.push(IndexCall::IndexHandle(did.to_string(), force));
    Ok(())
  }

  async fn update_actor_status(&self, did: &str, active: bool, status: Option<&str>) -> Result<(), IndexError> {
    self.push(IndexCall::UpdateActorStatus(
      did.to_string(),
      active,
      status.map(str::to_string),
    ));
    Ok(())
  }

  async fn delete_actor(&self, did: &str) -> Result<(), IndexError> {
    self.push(IndexCall::DeleteActor(did.to_string()));
    Ok(())
  }

  async fn set_commit_last_seen(&self, did: &str, commit: Option<&str>, rev: &str) -> Result<(), IndexError> {
    self.push(IndexCall::SetCommitLastSeen(
      did.to_string(),
      commit.map(str::to_string),
      rev.to_string(),
    ));
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
  Panic,
  Fail,
}

/// Memory index that injects one fault when a record URI ending in
/// `target` is indexed, and optionally refuses the first `connect` calls.
#[derive(Clone)]
pub struct FaultyFactory {
  pub index: MemoryIndex,
  fault: Fault,
  target: String,
  tripped: Arc<AtomicBool>,
  refuse_connects: Arc<AtomicUsize>,
  pub connects: Arc<AtomicUsize>,
}

impl FaultyFactory {
  pub fn new(fault: Fault, target: impl Into<String>) -> Self {
    Self {
      index: MemoryIndex::new(),
      fault,
      target: target.into(),
      tripped: Arc::new(AtomicBool::new(false)),
      refuse_connects: Arc::new(AtomicUsize::new(0)),
      connects: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn refusing_connects(self, count: usize) -> Self {
    self.refuse_connects.store(count, Ordering::SeqCst);
    self
  }

  pub fn tripped(&self) -> bool {
    self.tripped.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl IndexingFactory for FaultyFactory {
  async fn connect(&self, _config: &IndexingConfig) -> Result<Arc<dyn IndexingService>, IndexError> {
    self.connects.fetch_add(1, Ordering::SeqCst);
    let refused = self
      .refuse_connects
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
      .is_ok();
    if refused {
      return Err(IndexError::Connect("database not ready".into()));
    }
    Ok(Arc::new(self.clone()))
  }
}

#[async_trait]
impl IndexingService for FaultyFactory {
  async fn index_record(
    &self,
    uri: &str,
    cid: &str,
    record: &Value,
    action: WriteAction,
    time: &str,
  ) -> Result<(), IndexError> {
    if uri.ends_with(&self.target) && !self.tripped.swap(true, Ordering::SeqCst) {
      match self.fault {
        Fault::Panic => panic!("injected panic indexing {uri}"),
        Fault::Fail => return Err(IndexError::Store(format!("injected failure indexing {uri}"))),
      }
    }
    self.index.index_record(uri, cid, record, action, time).await
  }

  async fn delete_record(&self, uri: &str) -> Result<(), IndexError> {
    self.index.delete_record(uri).await
  }

  async fn index_handle(&self, did: &str, time: &str, force: bool) -> Result<(), IndexError> {
    self.index.index_handle(did, time, force).await
  }

  async fn update_actor_status(&self, did: &str, active: bool, status: Option<&str>) -> Result<(), IndexError> {
    self.index.update_actor_status(did, active, status).await
  }

  async fn delete_actor(&self, did: &str) -> Result<(), IndexError> {
    self.index.delete_actor(did).await
  }

  async fn set_commit_last_seen(&self, did: &str, commit: Option<&str>, rev: &str) -> Result<(), IndexError> {
    self.index.set_commit_last_seen(did, commit, rev).await
  }
}

// ============================================================================
// Firehose
// ============================================================================

pub type Session = Vec<Result<Bytes, ConnectionError>>;

/// Replays one canned session per `connect`, then idles. Each session stays
/// open after its last frame unless that frame ends it.
#[derive(Default)]
pub struct ScriptedConnector {
  sessions: Mutex<VecDeque<Session>>,
  cursors: Mutex<Vec<Option<i64>>>,
}

impl ScriptedConnector {
  pub fn new(sessions: Vec<Session>) -> Self {
    Self {
      sessions: Mutex::new(sessions.into()),
      cursors: Mutex::new(Vec::new()),
    }
  }

  /// Cursor passed to each `connect`, in order.
  pub fn cursors(&self) -> Vec<Option<i64>> {
    self.cursors.lock().unwrap().clone()
  }
}

#[async_trait]
impl FirehoseConnector for ScriptedConnector {
  async fn connect(&self, cursor: Option<i64>) -> Result<FrameStream, ConnectionError> {
    self.cursors.lock().unwrap().push(cursor);
    let session = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
    Ok(stream::iter(session).chain(stream::pending()).boxed())
  }
}

pub fn frames(frames: impl IntoIterator<Item = Vec<u8>>) -> Session {
  frames.into_iter().map(|frame| Ok(Bytes::from(frame))).collect()
}

// ============================================================================
// Errors and contexts
// ============================================================================

/// Collects reported errors as `(kind, message)`.
#[derive(Clone, Default)]
pub struct ErrorLog {
  entries: Arc<Mutex<Vec<(&'static str, String)>>>,
}

impl ErrorLog {
  pub fn handler(&self) -> ErrorHandler {
    let entries = self.entries.clone();
    Arc::new(move |err: &IngestError| {
      let kind = match err {
        IngestError::Connection(_) => "connection",
        IngestError::Decode(_) => "decode",
        IngestError::Validation(_) => "validation",
        IngestError::Apply(_) => "apply",
        IngestError::Queue(_) => "queue",
        IngestError::WorkerFault { .. } => "worker_fault",
        IngestError::Scaling(_) => "scaling",
      };
      entries.lock().unwrap().push((kind, err.to_string()));
    })
  }

  pub fn count(&self, kind: &str) -> usize {
    self.entries.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
  }

  pub fn messages(&self, kind: &str) -> Vec<String> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .filter(|(k, _)| *k == kind)
      .map(|(_, message)| message.clone())
      .collect()
  }
}

/// Worker context with short timings suitable for tests.
pub fn worker_context(transport: Transport, factory: Arc<dyn IndexingFactory>, on_error: ErrorHandler) -> Arc<WorkerContext> {
  Arc::new(WorkerContext {
    transport,
    factory,
    indexing: IndexingConfig::default(),
    validator: Arc::new(AcceptAll),
    settings: WorkerConfig {
      concurrency: 4,
      shutdown_grace_ms: 1_000,
      restart_delay_ms: 50,
      ..Default::default()
    },
    watermarks: Arc::new(Watermarks::default()),
    on_error,
    instance: "test".to_string(),
  })
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let start = std::time::Instant::now();
  while start.elapsed() < timeout {
    if check().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  false
}
