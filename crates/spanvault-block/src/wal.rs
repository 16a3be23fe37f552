// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write-ahead log backing a head block.
//!
//! One entry per accepted append: `len: u32 | crc32: u32 | body`, little
//! endian, where the body is one `(id, fragment)` object record. Appends are
//! written and fsynced before the ingester acknowledges, which is what makes
//! a distributor-visible success durable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::object::{encode_object, ObjectDecoder};
use crate::BlockError;

const ENTRY_HEADER_SIZE: usize = 8;

pub struct Wal {
    path: PathBuf,
    file: File,
    size: u64,
}

impl Wal {
    /// Creates a fresh WAL file. Fails if the path already exists, so a
    /// crashed predecessor is never silently overwritten.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, BlockError> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Wal {
            path,
            file,
            size: 0,
        })
    }

    /// Appends one `(id, fragment)` entry, write-then-sync.
    pub fn append(&mut self, id: &[u8], fragment: &[u8]) -> Result<(), BlockError> {
        let mut body = Vec::with_capacity(id.len() + fragment.len() + 8);
        encode_object(&mut body, id, fragment);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], body.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], checksum);

        self.file.write_all(&header)?;
        self.file.write_all(&body)?;
        self.file.sync_data()?;
        self.size += (ENTRY_HEADER_SIZE + body.len()) as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays all entries of a WAL file.
    ///
    /// A torn write at the tail (short header, short body or checksum
    /// mismatch) is truncated away so the file is clean for any later
    /// reader; everything before it is returned.
    pub fn replay(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BlockError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let good = offset;

            if bytes.len() - offset < ENTRY_HEADER_SIZE {
                truncate_at(path, good, "short entry header")?;
                break;
            }
            let len = LittleEndian::read_u32(&bytes[offset..offset + 4]) as usize;
            let checksum = LittleEndian::read_u32(&bytes[offset + 4..offset + 8]);
            offset += ENTRY_HEADER_SIZE;

            if bytes.len() - offset < len {
                truncate_at(path, good, "short entry body")?;
                break;
            }
            let body = &bytes[offset..offset + len];
            offset += len;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(body);
            if hasher.finalize() != checksum {
                truncate_at(path, good, "entry checksum mismatch")?;
                break;
            }

            let mut decoder = ObjectDecoder::new(body);
            match decoder.next() {
                Some(Ok(pair)) => entries.push(pair),
                _ => {
                    truncate_at(path, good, "undecodable entry body")?;
                    break;
                }
            }
        }

        Ok(entries)
    }
}

fn truncate_at(path: &Path, offset: usize, reason: &str) -> Result<(), BlockError> {
    warn!(
        path = %path.display(),
        offset,
        reason,
        "truncating torn tail of wal file"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset as u64)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Vec<u8> {
        vec![n; 16]
    }

    #[test]
    fn test_append_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.wal");

        let mut wal = Wal::create(&path).unwrap();
        wal.append(&id(1), b"one").unwrap();
        wal.append(&id(2), b"two").unwrap();
        wal.append(&id(1), b"more of one").unwrap();
        drop(wal);

        let entries = Wal::replay(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                (id(1), b"one".to_vec()),
                (id(2), b"two".to_vec()),
                (id(1), b"more of one".to_vec()),
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.wal");

        let mut wal = Wal::create(&path).unwrap();
        wal.append(&id(1), b"whole").unwrap();
        let good_size = wal.size();
        wal.append(&id(2), b"torn").unwrap();
        drop(wal);

        // chop the middle of the second entry
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_size + 11).unwrap();
        drop(file);

        let entries = Wal::replay(&path).unwrap();
        assert_eq!(entries, vec![(id(1), b"whole".to_vec())]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);

        // a second replay sees a clean file
        let entries = Wal::replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_checksum_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.wal");

        let mut wal = Wal::create(&path).unwrap();
        wal.append(&id(1), b"first").unwrap();
        let first_size = wal.size() as usize;
        wal.append(&id(2), b"second").unwrap();
        drop(wal);

        // flip one body byte of the second entry
        let mut bytes = std::fs::read(&path).unwrap();
        let victim = first_size + ENTRY_HEADER_SIZE + 2;
        bytes[victim] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let entries = Wal::replay(&path).unwrap();
        assert_eq!(entries, vec![(id(1), b"first".to_vec())]);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.wal");
        Wal::create(&path).unwrap();
        assert!(Wal::create(&path).is_err());
    }

    #[test]
    fn test_replay_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.wal");
        Wal::create(&path).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }
}
