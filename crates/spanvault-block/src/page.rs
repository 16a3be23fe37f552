// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page frames.
//!
//! The data object is a sequence of self-describing frames:
//! `length: u32 | checksum: u32 | payload`, little endian, where the payload
//! is the optionally-compressed object stream and the checksum covers the
//! payload as stored. `length` counts only the payload, so a frame occupies
//! `PAGE_HEADER_SIZE + length` bytes.

use byteorder::{ByteOrder, LittleEndian};
use spanvault_backend::Encoding;

use crate::BlockError;

pub const PAGE_HEADER_SIZE: usize = 8;

/// Compresses and frames one page payload.
pub fn frame_page(payload: &[u8], encoding: Encoding) -> Result<Vec<u8>, BlockError> {
    let stored: Vec<u8> = match encoding {
        Encoding::None => payload.to_vec(),
        Encoding::Zstd => zstd::stream::encode_all(payload, zstd::DEFAULT_COMPRESSION_LEVEL)?,
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&stored);
    let checksum = hasher.finalize();

    let mut frame = Vec::with_capacity(PAGE_HEADER_SIZE + stored.len());
    let mut header = [0u8; PAGE_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], stored.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], checksum);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&stored);
    Ok(frame)
}

/// Validates and decompresses one frame, returning the object stream.
pub fn unframe_page(frame: &[u8], encoding: Encoding) -> Result<Vec<u8>, BlockError> {
    if frame.len() < PAGE_HEADER_SIZE {
        return Err(BlockError::Corrupt(format!(
            "page frame too short: {} bytes",
            frame.len()
        )));
    }

    let length = LittleEndian::read_u32(&frame[0..4]) as usize;
    let checksum = LittleEndian::read_u32(&frame[4..8]);
    let stored = &frame[PAGE_HEADER_SIZE..];
    if stored.len() != length {
        return Err(BlockError::Corrupt(format!(
            "page length mismatch: header says {length}, frame carries {}",
            stored.len()
        )));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(stored);
    let actual = hasher.finalize();
    if actual != checksum {
        return Err(BlockError::Corrupt(format!(
            "page checksum mismatch: expected {checksum:#x}, got {actual:#x}"
        )));
    }

    match encoding {
        Encoding::None => Ok(stored.to_vec()),
        Encoding::Zstd => Ok(zstd::stream::decode_all(stored)?),
    }
}
