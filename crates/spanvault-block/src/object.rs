// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The object record codec used inside data pages and WAL entries:
//! `(id_len varint, id, obj_len varint, obj)`, concatenated.

use bytes::Buf;
use prost::encoding::{decode_varint, encode_varint};

use crate::BlockError;

/// Appends one `(id, obj)` record to `buf`.
pub fn encode_object(buf: &mut Vec<u8>, id: &[u8], obj: &[u8]) {
    encode_varint(id.len() as u64, buf);
    buf.extend_from_slice(id);
    encode_varint(obj.len() as u64, buf);
    buf.extend_from_slice(obj);
}

/// Encoded size of one record, for page-cut decisions.
pub fn encoded_object_len(id: &[u8], obj: &[u8]) -> usize {
    varint_len(id.len() as u64) + id.len() + varint_len(obj.len() as u64) + obj.len()
}

fn varint_len(v: u64) -> usize {
    ((64 - (v | 1).leading_zeros() as usize) + 6) / 7
}

/// Iterates the records of one page payload.
pub struct ObjectDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> ObjectDecoder<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        ObjectDecoder { buf: payload }
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>, BlockError> {
        if self.buf.remaining() < len {
            return Err(BlockError::Corrupt(format!(
                "object record truncated: want {len} bytes, have {}",
                self.buf.remaining()
            )));
        }
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }
}

impl<'a> Iterator for ObjectDecoder<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>), BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.buf.has_remaining() {
            return None;
        }

        let next = (|| {
            let id_len = decode_varint(&mut self.buf)
                .map_err(|e| BlockError::Corrupt(format!("bad id length varint: {e}")))?;
            let id = self.take(id_len as usize)?;
            let obj_len = decode_varint(&mut self.buf)
                .map_err(|e| BlockError::Corrupt(format!("bad object length varint: {e}")))?;
            let obj = self.take(obj_len as usize)?;
            Ok((id, obj))
        })();

        Some(next)
    }
}
