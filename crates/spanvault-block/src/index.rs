// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The block index: fixed-width records sorted by trace id, one per page,
//! followed by a footer with the record count and entry size. Fixed width is
//! what makes `at(i)` and binary search possible without scanning.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::BlockError;

/// One index entry. `id` is the highest trace id stored in the page starting
/// at `start` and occupying `length` bytes of the data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Vec<u8>,
    pub start: u64,
    pub length: u32,
}

/// Bytes per record on disk: 16 id + 8 start + 4 length.
pub const RECORD_SIZE: usize = 28;
const FOOTER_SIZE: usize = 8;

pub struct IndexWriter {
    buf: Vec<u8>,
    count: u32,
}

impl Default for IndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexWriter {
    pub fn new() -> Self {
        IndexWriter {
            buf: Vec::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, record: &Record) {
        debug_assert_eq!(record.id.len(), 16);
        let mut entry = [0u8; RECORD_SIZE];
        entry[..16].copy_from_slice(&record.id);
        LittleEndian::write_u64(&mut entry[16..24], record.start);
        LittleEndian::write_u32(&mut entry[24..28], record.length);
        self.buf.extend_from_slice(&entry);
        self.count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        let mut footer = [0u8; FOOTER_SIZE];
        LittleEndian::write_u32(&mut footer[0..4], self.count);
        LittleEndian::write_u32(&mut footer[4..8], RECORD_SIZE as u32);
        self.buf.extend_from_slice(&footer);
        self.buf
    }
}

#[derive(Clone)]
pub struct IndexReader {
    bytes: Bytes,
    count: usize,
}

impl IndexReader {
    pub fn new(bytes: Bytes) -> Result<Self, BlockError> {
        if bytes.len() < FOOTER_SIZE {
            return Err(BlockError::Corrupt("index shorter than footer".to_string()));
        }
        let footer = &bytes[bytes.len() - FOOTER_SIZE..];
        let count = LittleEndian::read_u32(&footer[0..4]) as usize;
        let record_size = LittleEndian::read_u32(&footer[4..8]) as usize;

        if record_size != RECORD_SIZE {
            return Err(BlockError::Corrupt(format!(
                "unsupported index record size {record_size}"
            )));
        }
        if bytes.len() != count * RECORD_SIZE + FOOTER_SIZE {
            return Err(BlockError::Corrupt(format!(
                "index length {} does not match {count} records",
                bytes.len()
            )));
        }
        Ok(IndexReader { bytes, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Random access without scanning.
    pub fn at(&self, i: usize) -> Option<Record> {
        if i >= self.count {
            return None;
        }
        let entry = &self.bytes[i * RECORD_SIZE..(i + 1) * RECORD_SIZE];
        Some(Record {
            id: entry[..16].to_vec(),
            start: LittleEndian::read_u64(&entry[16..24]),
            length: LittleEndian::read_u32(&entry[24..28]),
        })
    }

    fn id_at(&self, i: usize) -> &[u8] {
        &self.bytes[i * RECORD_SIZE..i * RECORD_SIZE + 16]
    }

    /// Binary-searches for the first record whose id is >= `id` (record ids
    /// are page maxima, so that record's page is the only one that can hold
    /// `id`). Returns the record and its position, or `None` when every
    /// record id is smaller than `id`.
    pub fn find(&self, id: &[u8]) -> Option<(Record, usize)> {
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.id_at(mid) < id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.count {
            return None;
        }
        self.at(lo).map(|r| (r, lo))
    }
}
