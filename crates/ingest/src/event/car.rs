//! CAR v1 block sections carried in commit and sync events.
//!
//! Layout: `varint(len) header` followed by `varint(len) cid block` sections.
//! Block hashes are not verified.

use std::collections::HashMap;

use minicbor::Decoder;

use super::{
  DecodeError,
  codec::{Cid, Ipld, decode_value, read_varint},
};

#[derive(Debug, Default)]
pub struct Car<'a> {
  pub roots: Vec<Cid>,
  blocks: HashMap<Cid, &'a [u8]>,
}

impl<'a> Car<'a> {
  pub fn parse(bytes: &'a [u8]) -> Result<Self, DecodeError> {
    let mut pos = 0;
    let header_len = read_varint(bytes, &mut pos)? as usize;
    let header = section(bytes, pos, header_len)?;
    pos += header_len;

    let roots = match decode_value(&mut Decoder::new(header), 0)? {
      Ipld::Map(mut fields) => match fields.remove("roots") {
        Some(Ipld::List(items)) => items
          .into_iter()
          .filter_map(|item| match item {
            Ipld::Link(cid) => Some(cid),
            _ => None,
          })
          .collect(),
        _ => Vec::new(),
      },
      _ => return Err(DecodeError::Car("header is not a map")),
    };

    let mut blocks = HashMap::new();
    while pos < bytes.len() {
      let len = read_varint(bytes, &mut pos)? as usize;
      let block = section(bytes, pos, len)?;
      pos += len;

      let (cid, cid_len) = Cid::read_prefix(block)?;
      blocks.insert(cid, &block[cid_len..]);
    }

    Ok(Self { roots, blocks })
  }

  pub fn block(&self, cid: &Cid) -> Option<&'a [u8]> {
    self.blocks.get(cid).copied()
  }

  /// Decode a DAG-CBOR block into its JSON form.
  pub fn record(&self, cid: &Cid) -> Result<Option<serde_json::Value>, DecodeError> {
    match self.block(cid) {
      Some(block) => Ok(Some(decode_value(&mut Decoder::new(block), 0)?.to_json())),
      None => Ok(None),
    }
  }

  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }
}

fn section(bytes: &[u8], start: usize, len: usize) -> Result<&[u8], DecodeError> {
  start
    .checked_add(len)
    .and_then(|end| bytes.get(start..end))
    .ok_or(DecodeError::Car("section runs past end of input"))
}
