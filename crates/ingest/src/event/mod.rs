//! Repo events and their domain expansion
//!
//! A raw frame goes through three steps before anything touches the index:
//!
//! ```text
//! bytes --read_frame--> Frame --validate--> RepoEvent --expand--> Vec<DomainEvent>
//! ```
//!
//! Decode and validation failures are per-frame: the frame is skipped, the
//! pipeline keeps going.

pub mod car;
pub mod codec;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use self::{
  car::Car,
  codec::{Cid, Ipld, read_frame},
};

// ============================================================================
// Errors
// ============================================================================

/// The frame could not be decoded at all.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("cbor decode: {0}")]
  Cbor(#[from] minicbor::decode::Error),
  #[error("frame truncated")]
  Truncated,
  #[error("indefinite-length item")]
  IndefiniteLength,
  #[error("malformed frame: {0}")]
  Malformed(&'static str),
  #[error("invalid cid: {0}")]
  InvalidCid(&'static str),
  #[error("invalid car: {0}")]
  Car(&'static str),
  #[error("frame has no event type")]
  MissingType,
  #[error("unknown event type {0}")]
  UnknownType(String),
  #[error("upstream error frame: {error}")]
  ErrorFrame { error: String, message: Option<String> },
}

/// The frame decoded but does not match the event schema.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("{event_type}: missing field `{field}`")]
  MissingField { event_type: String, field: &'static str },
  #[error("{event_type}: field `{field}` is not a {expected}")]
  WrongType {
    event_type: String,
    field: &'static str,
    expected: &'static str,
  },
  #[error("{uri}: {reason}")]
  Record { uri: String, reason: String },
  #[error("{event_type}: {reason}")]
  Invalid { event_type: String, reason: String },
}

/// Either way the frame is skipped; the variant decides how it is reported.
#[derive(Debug, Error)]
pub enum FrameError {
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Validation(#[from] ValidationError),
}

// ============================================================================
// Schema validation seam
// ============================================================================

/// Record-level schema validation, supplied by the embedder.
pub trait SchemaValidator: Send + Sync {
  /// Reject a record body that does not match its collection's schema.
  fn validate_record(&self, collection: &str, record: &Value) -> Result<(), String>;
}

/// Validator that accepts every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
  fn validate_record(&self, _collection: &str, _record: &Value) -> Result<(), String> {
    Ok(())
  }
}

// ============================================================================
// Repo Events
// ============================================================================

pub const COMMIT: &str = "com.atproto.sync.subscribeRepos#commit";
pub const IDENTITY: &str = "com.atproto.sync.subscribeRepos#identity";
pub const ACCOUNT: &str = "com.atproto.sync.subscribeRepos#account";
pub const SYNC: &str = "com.atproto.sync.subscribeRepos#sync";

/// Kinds that decode fine but carry nothing to index.
const UNINDEXED: &[&str] = &[
  "com.atproto.sync.subscribeRepos#info",
  "com.atproto.sync.subscribeRepos#handle",
  "com.atproto.sync.subscribeRepos#migrate",
  "com.atproto.sync.subscribeRepos#tombstone",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
  pub action: OpAction,
  /// `collection/rkey`
  pub path: String,
  pub cid: Option<String>,
  pub record: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
  pub seq: i64,
  pub repo: String,
  pub rev: String,
  pub commit: String,
  pub time: String,
  pub ops: Vec<RepoOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
  pub seq: i64,
  pub did: String,
  pub time: String,
  pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
  pub seq: i64,
  pub did: String,
  pub time: String,
  pub active: bool,
  pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
  pub seq: i64,
  pub did: String,
  pub time: String,
  pub rev: String,
  /// Root of the CAR slice, when present
  pub commit: Option<String>,
}

/// One decoded unit from the firehose.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
  Commit(Commit),
  Identity(Identity),
  Account(Account),
  Sync(SyncEvent),
  Unknown { event_type: String, seq: Option<i64> },
}

impl RepoEvent {
  pub fn seq(&self) -> Option<i64> {
    match self {
      RepoEvent::Commit(c) => Some(c.seq),
      RepoEvent::Identity(i) => Some(i.seq),
      RepoEvent::Account(a) => Some(a.seq),
      RepoEvent::Sync(s) => Some(s.seq),
      RepoEvent::Unknown { seq, .. } => *seq,
    }
  }
}

// ============================================================================
// Domain Events
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
  pub did: String,
  pub time: String,
  pub uri: String,
  pub cid: String,
  pub record: Value,
  pub commit: String,
  pub rev: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDelete {
  pub did: String,
  pub time: String,
  pub uri: String,
  pub commit: String,
  pub rev: String,
}

/// One flattened, single-operation unit applied to the index.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
  RecordCreate(RecordWrite),
  RecordUpdate(RecordWrite),
  RecordDelete(RecordDelete),
  IdentityUpdate {
    did: String,
    time: String,
    handle: Option<String>,
  },
  AccountStatusChange {
    did: String,
    time: String,
    active: bool,
    status: Option<String>,
  },
  SyncCheckpoint {
    did: String,
    time: String,
    commit: Option<String>,
    rev: String,
  },
}

impl DomainEvent {
  pub fn did(&self) -> &str {
    match self {
      DomainEvent::RecordCreate(w) | DomainEvent::RecordUpdate(w) => &w.did,
      DomainEvent::RecordDelete(d) => &d.did,
      DomainEvent::IdentityUpdate { did, .. }
      | DomainEvent::AccountStatusChange { did, .. }
      | DomainEvent::SyncCheckpoint { did, .. } => did,
    }
  }

  pub fn time(&self) -> &str {
    match self {
      DomainEvent::RecordCreate(w) | DomainEvent::RecordUpdate(w) => &w.time,
      DomainEvent::RecordDelete(d) => &d.time,
      DomainEvent::IdentityUpdate { time, .. }
      | DomainEvent::AccountStatusChange { time, .. }
      | DomainEvent::SyncCheckpoint { time, .. } => time,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      DomainEvent::RecordCreate(_) => "create",
      DomainEvent::RecordUpdate(_) => "update",
      DomainEvent::RecordDelete(_) => "delete",
      DomainEvent::IdentityUpdate { .. } => "identity",
      DomainEvent::AccountStatusChange { .. } => "account",
      DomainEvent::SyncCheckpoint { .. } => "sync",
    }
  }
}

/// Expand a repo event into the domain events to apply, in order.
///
/// A commit yields one event per op; identity, account and sync yield
/// exactly one; unknown kinds yield none.
pub fn expand(event: RepoEvent) -> Vec<DomainEvent> {
  match event {
    RepoEvent::Commit(commit) => {
      let Commit {
        repo,
        rev,
        commit,
        time,
        ops,
        ..
      } = commit;
      ops
        .into_iter()
        .map(|op| {
          let uri = format!("at://{repo}/{}", op.path);
          match (op.action, op.cid, op.record) {
            (OpAction::Create, Some(cid), Some(record)) => DomainEvent::RecordCreate(RecordWrite {
              did: repo.clone(),
              time: time.clone(),
              uri,
              cid,
              record,
              commit: commit.clone(),
              rev: rev.clone(),
            }),
            (OpAction::Update, Some(cid), Some(record)) => DomainEvent::RecordUpdate(RecordWrite {
              did: repo.clone(),
              time: time.clone(),
              uri,
              cid,
              record,
              commit: commit.clone(),
              rev: rev.clone(),
            }),
            // Validation guarantees writes carry cid + record
            _ => DomainEvent::RecordDelete(RecordDelete {
              did: repo.clone(),
              time: time.clone(),
              uri,
              commit: commit.clone(),
              rev: rev.clone(),
            }),
          }
        })
        .collect()
    }
    RepoEvent::Identity(Identity { did, time, handle, .. }) => vec![DomainEvent::IdentityUpdate { did, time, handle }],
    RepoEvent::Account(Account {
      did,
      time,
      active,
      status,
      ..
    }) => vec![DomainEvent::AccountStatusChange {
      did,
      time,
      active,
      status,
    }],
    RepoEvent::Sync(SyncEvent {
      did, time, rev, commit, ..
    }) => vec![DomainEvent::SyncCheckpoint { did, time, commit, rev }],
    RepoEvent::Unknown { .. } => Vec::new(),
  }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode and validate a raw frame into a typed repo event.
pub fn decode(bytes: &[u8], validator: &dyn SchemaValidator) -> Result<RepoEvent, FrameError> {
  let frame = read_frame(bytes)?;

  if frame.is_error {
    let body = Body::new("#error", &frame.body);
    return Err(
      DecodeError::ErrorFrame {
        error: body.opt_str("error")?.unwrap_or("unknown").to_string(),
        message: body.opt_str("message")?.map(str::to_string),
      }
      .into(),
    );
  }

  let event_type = frame.event_type.ok_or(DecodeError::MissingType)?;
  let body = Body::new(&event_type, &frame.body);

  let event = match event_type.as_str() {
    COMMIT => RepoEvent::Commit(parse_commit(&body, validator)?),
    IDENTITY => RepoEvent::Identity(Identity {
      seq: body.int("seq")?,
      did: body.str("did")?.to_string(),
      time: body.str("time")?.to_string(),
      handle: body.opt_str("handle")?.map(str::to_string),
    }),
    ACCOUNT => RepoEvent::Account(Account {
      seq: body.int("seq")?,
      did: body.str("did")?.to_string(),
      time: body.str("time")?.to_string(),
      active: body.bool("active")?,
      status: body.opt_str("status")?.map(str::to_string),
    }),
    SYNC => {
      let blocks = body.bytes("blocks")?;
      let car = Car::parse(blocks)?;
      RepoEvent::Sync(SyncEvent {
        seq: body.int("seq")?,
        did: body.str("did")?.to_string(),
        time: body.str("time")?.to_string(),
        rev: body.str("rev")?.to_string(),
        commit: car.roots.first().map(Cid::to_string),
      })
    }
    t if UNINDEXED.contains(&t) => RepoEvent::Unknown {
      seq: body.opt_int("seq")?,
      event_type: event_type.clone(),
    },
    _ => return Err(DecodeError::UnknownType(event_type).into()),
  };

  Ok(event)
}

fn parse_commit(body: &Body<'_>, validator: &dyn SchemaValidator) -> Result<Commit, FrameError> {
  let repo = body.str("repo")?.to_string();
  let blocks = body.bytes("blocks")?;
  let car = Car::parse(blocks)?;

  let mut ops = Vec::new();
  for item in body.list("ops")? {
    let Ipld::Map(fields) = item else {
      return Err(body.wrong_type("ops", "list of maps").into());
    };
    let op = Body::new(body.event_type, fields);
    let path = op.str("path")?.to_string();
    let action = match op.str("action")? {
      "create" => OpAction::Create,
      "update" => OpAction::Update,
      "delete" => OpAction::Delete,
      other => {
        return Err(
          ValidationError::Invalid {
            event_type: body.event_type.to_string(),
            reason: format!("unknown op action `{other}`"),
          }
          .into(),
        );
      }
    };

    let uri = format!("at://{repo}/{path}");
    let (collection, _rkey) = path.split_once('/').ok_or_else(|| ValidationError::Record {
      uri: uri.clone(),
      reason: "record path is not collection/rkey".into(),
    })?;

    let cid = op.opt_link("cid")?;
    let record = match action {
      OpAction::Delete => None,
      OpAction::Create | OpAction::Update => {
        let cid = cid.ok_or_else(|| ValidationError::Record {
          uri: uri.clone(),
          reason: "write without a cid".into(),
        })?;
        let record = car.record(cid)?.ok_or_else(|| ValidationError::Record {
          uri: uri.clone(),
          reason: format!("block {cid} missing from commit"),
        })?;
        validator
          .validate_record(collection, &record)
          .map_err(|reason| ValidationError::Record { uri, reason })?;
        Some(record)
      }
    };

    ops.push(RepoOp {
      action,
      path,
      cid: cid.map(Cid::to_string),
      record,
    });
  }

  Ok(Commit {
    seq: body.int("seq")?,
    repo,
    rev: body.str("rev")?.to_string(),
    commit: body.link("commit")?.to_string(),
    time: body.str("time")?.to_string(),
    ops,
  })
}

/// Typed field access over a decoded body map.
struct Body<'a> {
  event_type: &'a str,
  fields: &'a BTreeMap<String, Ipld>,
}

impl<'a> Body<'a> {
  fn new(event_type: &'a str, fields: &'a BTreeMap<String, Ipld>) -> Self {
    Self { event_type, fields }
  }

  fn missing(&self, field: &'static str) -> ValidationError {
    ValidationError::MissingField {
      event_type: self.event_type.to_string(),
      field,
    }
  }

  fn wrong_type(&self, field: &'static str, expected: &'static str) -> ValidationError {
    ValidationError::WrongType {
      event_type: self.event_type.to_string(),
      field,
      expected,
    }
  }

  fn get(&self, field: &'static str) -> Option<&'a Ipld> {
    match self.fields.get(field) {
      None | Some(Ipld::Null) => None,
      Some(value) => Some(value),
    }
  }

  fn opt_str(&self, field: &'static str) -> Result<Option<&'a str>, ValidationError> {
    match self.get(field) {
      None => Ok(None),
      Some(Ipld::String(s)) => Ok(Some(s)),
      Some(_) => Err(self.wrong_type(field, "string")),
    }
  }

  fn str(&self, field: &'static str) -> Result<&'a str, ValidationError> {
    self.opt_str(field)?.ok_or_else(|| self.missing(field))
  }

  fn opt_int(&self, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match self.get(field) {
      None => Ok(None),
      Some(Ipld::Integer(i)) => Ok(Some(*i)),
      Some(_) => Err(self.wrong_type(field, "integer")),
    }
  }

  fn int(&self, field: &'static str) -> Result<i64, ValidationError> {
    self.opt_int(field)?.ok_or_else(|| self.missing(field))
  }

  fn bool(&self, field: &'static str) -> Result<bool, ValidationError> {
    match self.get(field) {
      None => Err(self.missing(field)),
      Some(Ipld::Bool(b)) => Ok(*b),
      Some(_) => Err(self.wrong_type(field, "boolean")),
    }
  }

  fn bytes(&self, field: &'static str) -> Result<&'a [u8], ValidationError> {
    match self.get(field) {
      None => Err(self.missing(field)),
      Some(Ipld::Bytes(b)) => Ok(b),
      Some(_) => Err(self.wrong_type(field, "byte string")),
    }
  }

  fn list(&self, field: &'static str) -> Result<&'a [Ipld], ValidationError> {
    match self.get(field) {
      None => Err(self.missing(field)),
      Some(Ipld::List(items)) => Ok(items),
      Some(_) => Err(self.wrong_type(field, "list")),
    }
  }

  fn opt_link(&self, field: &'static str) -> Result<Option<&'a Cid>, ValidationError> {
    match self.get(field) {
      None => Ok(None),
      Some(Ipld::Link(cid)) => Ok(Some(cid)),
      Some(_) => Err(self.wrong_type(field, "cid link")),
    }
  }

  fn link(&self, field: &'static str) -> Result<&'a Cid, ValidationError> {
    self.opt_link(field)?.ok_or_else(|| self.missing(field))
  }
}
