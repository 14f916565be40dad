//! Frame envelope decoding
//!
//! A firehose frame is two concatenated CBOR items: a header map `{op, t}`
//! and a body map. Bodies and record blocks are DAG-CBOR, so the decoder is
//! strict about definite lengths and only understands tag 42 (CID links).

use std::{collections::BTreeMap, fmt};

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use data_encoding::BASE32_NOPAD;
use minicbor::{Decoder, data::Type};

use super::DecodeError;

/// Nesting limit for CBOR values. Records deeper than this are rejected.
const MAX_DEPTH: usize = 64;

/// DAG-CBOR CID link: tag 42 in its canonical two-byte encoding.
const CID_TAG: [u8; 2] = [0xd8, 0x2a];

const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

// ============================================================================
// Values
// ============================================================================

/// Content identifier in binary form (CIDv1).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(Vec<u8>);

impl Cid {
  /// Parse the payload of a tag-42 link (multibase identity prefix + CID).
  fn from_link(raw: &[u8]) -> Result<Self, DecodeError> {
    match raw.split_first() {
      Some((0x00, rest)) => {
        let (cid, len) = Self::read_prefix(rest)?;
        if len != rest.len() {
          return Err(DecodeError::InvalidCid("trailing bytes after link"));
        }
        Ok(cid)
      }
      _ => Err(DecodeError::InvalidCid("link missing identity multibase prefix")),
    }
  }

  /// Read a CIDv1 from the start of `bytes`, returning it with its length.
  pub(crate) fn read_prefix(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
    let mut pos = 0;
    let version = read_varint(bytes, &mut pos)?;
    if version != 1 {
      return Err(DecodeError::InvalidCid("only CIDv1 is supported"));
    }
    let _codec = read_varint(bytes, &mut pos)?;
    let _hash_code = read_varint(bytes, &mut pos)?;
    let digest_len = read_varint(bytes, &mut pos)? as usize;
    let end = pos
      .checked_add(digest_len)
      .filter(|end| *end <= bytes.len())
      .ok_or(DecodeError::InvalidCid("digest runs past end of input"))?;
    Ok((Cid(bytes[..end].to_vec()), end))
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

impl fmt::Display for Cid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "b{}", BASE32_NOPAD.encode(&self.0).to_ascii_lowercase())
  }
}

impl fmt::Debug for Cid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Cid({self})")
  }
}

/// Unsigned LEB128, as used by CIDs and CAR section lengths.
pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
  let mut value: u64 = 0;
  for shift in (0..64).step_by(7) {
    let byte = *bytes.get(*pos).ok_or(DecodeError::Truncated)?;
    *pos += 1;
    value |= u64::from(byte & 0x7f) << shift;
    if byte & 0x80 == 0 {
      return Ok(value);
    }
  }
  Err(DecodeError::Malformed("varint longer than 64 bits"))
}

/// Decoded DAG-CBOR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Ipld {
  Null,
  Bool(bool),
  Integer(i64),
  Float(f64),
  String(String),
  Bytes(Vec<u8>),
  List(Vec<Ipld>),
  Map(BTreeMap<String, Ipld>),
  Link(Cid),
}

impl Ipld {
  /// JSON form handed to the indexing service: links become
  /// `{"$link": cid}` and byte strings `{"$bytes": base64}`.
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::{Map, Value, json};

    match self {
      Ipld::Null => Value::Null,
      Ipld::Bool(b) => Value::Bool(*b),
      Ipld::Integer(i) => Value::from(*i),
      Ipld::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
      Ipld::String(s) => Value::String(s.clone()),
      Ipld::Bytes(b) => json!({ "$bytes": STANDARD_NO_PAD.encode(b) }),
      Ipld::List(items) => Value::Array(items.iter().map(Ipld::to_json).collect()),
      Ipld::Map(entries) => Value::Object(entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>()),
      Ipld::Link(cid) => json!({ "$link": cid.to_string() }),
    }
  }
}

/// Decode a single DAG-CBOR value from the decoder's current position.
pub(crate) fn decode_value(dec: &mut Decoder<'_>, depth: usize) -> Result<Ipld, DecodeError> {
  if depth > MAX_DEPTH {
    return Err(DecodeError::Malformed("value nested too deeply"));
  }

  match dec.datatype()? {
    Type::Null | Type::Undefined => {
      dec.skip()?;
      Ok(Ipld::Null)
    }
    Type::Bool => Ok(Ipld::Bool(dec.bool()?)),
    Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
      Ok(Ipld::Integer(dec.i64()?))
    }
    Type::F64 => Ok(Ipld::Float(dec.f64()?)),
    Type::F32 => Ok(Ipld::Float(f64::from(dec.f32()?))),
    Type::String => Ok(Ipld::String(dec.str()?.to_owned())),
    Type::Bytes => Ok(Ipld::Bytes(dec.bytes()?.to_vec())),
    Type::Array => {
      let len = definite(dec.array()?)?;
      let mut items = Vec::with_capacity(len.min(1024));
      for _ in 0..len {
        items.push(decode_value(dec, depth + 1)?);
      }
      Ok(Ipld::List(items))
    }
    Type::Map => {
      let len = definite(dec.map()?)?;
      let mut entries = BTreeMap::new();
      for _ in 0..len {
        let key = dec.str()?.to_owned();
        let value = decode_value(dec, depth + 1)?;
        entries.insert(key, value);
      }
      Ok(Ipld::Map(entries))
    }
    Type::Tag => {
      let pos = dec.position();
      if dec.input().get(pos..pos + 2) != Some(&CID_TAG[..]) {
        return Err(DecodeError::Malformed("unsupported CBOR tag"));
      }
      dec.set_position(pos + 2);
      Ok(Ipld::Link(Cid::from_link(dec.bytes()?)?))
    }
    Type::StringIndef | Type::BytesIndef | Type::ArrayIndef | Type::MapIndef => Err(DecodeError::IndefiniteLength),
    _ => Err(DecodeError::Malformed("unsupported CBOR type")),
  }
}

fn definite(len: Option<u64>) -> Result<usize, DecodeError> {
  let len = len.ok_or(DecodeError::IndefiniteLength)?;
  usize::try_from(len).map_err(|_| DecodeError::Malformed("length out of range"))
}

// ============================================================================
// Frames
// ============================================================================

/// Prefix short `#kind` types with the subscription namespace.
pub fn normalize_type(t: &str) -> String {
  if t.starts_with('#') {
    format!("{SUBSCRIBE_REPOS}{t}")
  } else {
    t.to_string()
  }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  /// Fully-qualified event type (`None` only for error frames)
  pub event_type: Option<String>,
  pub body: BTreeMap<String, Ipld>,
  pub is_error: bool,
}

/// What the reader needs from a frame without decoding record blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSummary {
  Message {
    event_type: Option<String>,
    seq: Option<i64>,
    time: Option<String>,
  },
  Error {
    error: String,
    message: Option<String>,
  },
}

struct Header {
  op: i64,
  t: Option<String>,
}

fn decode_header(dec: &mut Decoder<'_>) -> Result<Header, DecodeError> {
  let len = definite(dec.map()?)?;
  let mut op = None;
  let mut t = None;
  for _ in 0..len {
    match dec.str()? {
      "op" => op = Some(dec.i64()?),
      "t" => t = Some(dec.str()?.to_owned()),
      _ => dec.skip()?,
    }
  }
  let op = op.ok_or(DecodeError::Malformed("header missing op"))?;
  if op != 1 && op != -1 {
    return Err(DecodeError::Malformed("header op must be 1 or -1"));
  }
  Ok(Header { op, t })
}

fn ensure_body(dec: &Decoder<'_>) -> Result<(), DecodeError> {
  if dec.position() >= dec.input().len() {
    return Err(DecodeError::Truncated);
  }
  Ok(())
}

/// Decode header and body of a frame.
pub fn read_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
  let mut dec = Decoder::new(bytes);
  let header = decode_header(&mut dec)?;
  ensure_body(&dec)?;

  let body = match decode_value(&mut dec, 0)? {
    Ipld::Map(entries) => entries,
    _ => return Err(DecodeError::Malformed("frame body is not a map")),
  };

  Ok(Frame {
    event_type: header.t.as_deref().map(normalize_type),
    body,
    is_error: header.op == -1,
  })
}

/// Extract sequence, time and type, skipping everything else in the body.
pub fn peek(bytes: &[u8]) -> Result<FrameSummary, DecodeError> {
  let mut dec = Decoder::new(bytes);
  let header = decode_header(&mut dec)?;
  ensure_body(&dec)?;

  let len = definite(dec.map()?)?;
  if header.op == -1 {
    let mut error = None;
    let mut message = None;
    for _ in 0..len {
      match dec.str()? {
        "error" => error = Some(dec.str()?.to_owned()),
        "message" => message = Some(dec.str()?.to_owned()),
        _ => dec.skip()?,
      }
    }
    return Ok(FrameSummary::Error {
      error: error.unwrap_or_else(|| "unknown".to_string()),
      message,
    });
  }

  let mut seq = None;
  let mut time = None;
  for _ in 0..len {
    match dec.str()? {
      "seq" => seq = Some(dec.i64()?),
      "time" => time = Some(dec.str()?.to_owned()),
      _ => dec.skip()?,
    }
  }

  Ok(FrameSummary::Message {
    event_type: header.t.as_deref().map(normalize_type),
    seq,
    time,
  })
}
