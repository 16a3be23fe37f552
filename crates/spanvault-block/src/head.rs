// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The head block: the ingester's currently-writable accumulator.
//!
//! Pushed fragments go straight to the WAL for durability. When a live trace
//! is cut, its combined bytes are added to the in-memory object list, which
//! is what the sealed head is built from. Sealing renames the WAL file so a
//! crash between seal and block build is recoverable by replaying the sealed
//! file.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::wal::Wal;
use crate::BlockError;

const WAL_EXT: &str = ".wal";
const SEALED_EXT: &str = ".sealed.wal";

fn wal_file_name(block_id: Uuid, tenant: &str) -> String {
    format!("{block_id}+{tenant}{WAL_EXT}")
}

fn sealed_file_name(block_id: Uuid, tenant: &str) -> String {
    format!("{block_id}+{tenant}{SEALED_EXT}")
}

/// Parses a WAL directory entry into `(block id, tenant, sealed)`.
pub fn parse_wal_file_name(name: &str) -> Option<(Uuid, String, bool)> {
    let (stem, sealed) = if let Some(stem) = name.strip_suffix(SEALED_EXT) {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(WAL_EXT) {
        (stem, false)
    } else {
        return None;
    };

    let (block_id, tenant) = stem.split_once('+')?;
    let block_id = Uuid::parse_str(block_id).ok()?;
    if tenant.is_empty() {
        return None;
    }
    Some((block_id, tenant.to_string(), sealed))
}

pub struct HeadBlock {
    block_id: Uuid,
    tenant: String,
    wal: Wal,
    wal_dir: PathBuf,
    objects: Vec<(Vec<u8>, Vec<u8>)>,
    objects_size: usize,
    created_at: Instant,
}

impl HeadBlock {
    pub fn new(wal_dir: &Path, tenant: &str) -> Result<Self, BlockError> {
        let block_id = Uuid::new_v4();
        let wal = Wal::create(wal_dir.join(wal_file_name(block_id, tenant)))?;
        Ok(HeadBlock {
            block_id,
            tenant: tenant.to_string(),
            wal,
            wal_dir: wal_dir.to_path_buf(),
            objects: Vec::new(),
            objects_size: 0,
            created_at: Instant::now(),
        })
    }

    pub fn block_id(&self) -> Uuid {
        self.block_id
    }

    /// Durably records one pushed fragment. Returns only after the bytes are
    /// synced, so an acknowledged push survives a crash.
    pub fn append_fragment(&mut self, id: &[u8], fragment: &[u8]) -> Result<(), BlockError> {
        self.wal.append(id, fragment)
    }

    /// Adds the combined bytes of a cut live trace to the block contents.
    pub fn push_complete_object(&mut self, id: Vec<u8>, obj: Vec<u8>) {
        self.objects_size += obj.len();
        self.objects.push((id, obj));
    }

    /// All cut objects matching `id`, for the query path. A trace cut twice
    /// into the same head shows up twice; callers combine.
    pub fn find_objects(&self, id: &[u8]) -> Vec<&[u8]> {
        self.objects
            .iter()
            .filter(|(oid, _)| oid == id)
            .map(|(_, obj)| obj.as_slice())
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Bytes accepted into the WAL, which is what rotation thresholds watch.
    pub fn wal_size(&self) -> u64 {
        self.wal.size()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Seals the head: renames the WAL file and hands back everything needed
    /// to build the complete block. The caller must have cut all live traces
    /// into the head first so the sealed contents are the whole block.
    pub fn seal(self) -> Result<SealedWal, BlockError> {
        let sealed_path = self
            .wal_dir
            .join(sealed_file_name(self.block_id, &self.tenant));
        std::fs::rename(self.wal.path(), &sealed_path)?;
        Ok(SealedWal {
            path: sealed_path,
            block_id: self.block_id,
            tenant: self.tenant,
            objects: self.objects,
        })
    }
}

/// A sealed head awaiting its complete-block build. The WAL file is only
/// deleted once the built block is durable on local disk.
pub struct SealedWal {
    pub path: PathBuf,
    pub block_id: Uuid,
    pub tenant: String,
    pub objects: Vec<(Vec<u8>, Vec<u8>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_file_name_round_trip() {
        let id = Uuid::new_v4();
        let (parsed, tenant, sealed) =
            parse_wal_file_name(&wal_file_name(id, "tenant-a")).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(tenant, "tenant-a");
        assert!(!sealed);

        let (parsed, tenant, sealed) =
            parse_wal_file_name(&sealed_file_name(id, "tenant-a")).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(tenant, "tenant-a");
        assert!(sealed);

        assert!(parse_wal_file_name("garbage.txt").is_none());
        assert!(parse_wal_file_name("not-a-uuid+t.wal").is_none());
    }

    #[test]
    fn test_head_tracks_objects_and_seals() {
        let dir = tempfile::tempdir().unwrap();
        let mut head = HeadBlock::new(dir.path(), "t").unwrap();

        head.append_fragment(&[1; 16], b"frag-a").unwrap();
        head.append_fragment(&[1; 16], b"frag-b").unwrap();
        assert!(head.wal_size() > 0);

        head.push_complete_object(vec![1; 16], b"combined".to_vec());
        assert_eq!(head.find_objects(&[1; 16]), vec![b"combined".as_slice()]);
        assert!(head.find_objects(&[2; 16]).is_empty());

        let wal_path = dir.path().join(wal_file_name(head.block_id(), "t"));
        assert!(wal_path.exists());

        let sealed = head.seal().unwrap();
        assert!(!wal_path.exists());
        assert!(sealed.path.exists());
        assert_eq!(sealed.objects.len(), 1);

        // the sealed wal still replays the raw fragments
        let entries = Wal::replay(&sealed.path).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
