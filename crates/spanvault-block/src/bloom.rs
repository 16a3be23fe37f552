// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sharded bloom filter.
//!
//! The filter is split into N shards so a point lookup fetches ~1/N of the
//! filter bytes from the backend. The shard for an id is a pure function of
//! the id bytes, agreed between writer and readers; the shard count is
//! recorded in the block meta.

use byteorder::{ByteOrder, LittleEndian};

use crate::BlockError;

/// Deterministic shard selection: the first four id bytes mod the shard count.
pub fn shard_key(id: &[u8], shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    let mut prefix = [0u8; 4];
    let n = id.len().min(4);
    prefix[..n].copy_from_slice(&id[..n]);
    (u32::from_be_bytes(prefix) as usize) % shard_count
}

/// Classical bit-array bloom filter with double hashing.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    m: u64,
    k: u32,
}

const FNV1A_64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_64_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(data: &[u8], mut hash: u64) -> u64 {
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV1A_64_PRIME);
    }
    hash
}

impl BloomFilter {
    /// Sizes the filter for `expected` items at false-positive rate `fp`
    /// using the standard formulas `m = -n ln p / (ln 2)^2` and
    /// `k = m/n ln 2`.
    pub fn new(expected: usize, fp: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = fp.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = (((m as f64) / n) * ln2).round().max(1.0) as u32;

        BloomFilter {
            bits: vec![0u64; m.div_ceil(64) as usize],
            m,
            k,
        }
    }

    fn positions(&self, id: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = fnv1a64(id, FNV1A_64_OFFSET);
        // Second, independent pass over the id with a derived basis; forced
        // odd so the stride never collapses mod m.
        let h2 = fnv1a64(id, h1 ^ FNV1A_64_PRIME) | 1;
        let m = self.m;
        (0..u64::from(self.k)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn add(&mut self, id: &[u8]) {
        let positions: Vec<u64> = self.positions(id).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    pub fn test(&self, id: &[u8]) -> bool {
        self.positions(id)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    /// `m: u64 | k: u32 | bit words`, little endian.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.bits.len() * 8);
        let mut header = [0u8; 12];
        LittleEndian::write_u64(&mut header[0..8], self.m);
        LittleEndian::write_u32(&mut header[8..12], self.k);
        out.extend_from_slice(&header);
        for word in &self.bits {
            let mut b = [0u8; 8];
            LittleEndian::write_u64(&mut b, *word);
            out.extend_from_slice(&b);
        }
        out
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < 12 {
            return Err(BlockError::Corrupt("bloom shard too short".to_string()));
        }
        let m = LittleEndian::read_u64(&bytes[0..8]);
        let k = LittleEndian::read_u32(&bytes[8..12]);
        let words = m.div_ceil(64) as usize;
        if bytes.len() != 12 + words * 8 {
            return Err(BlockError::Corrupt(format!(
                "bloom shard length {} does not match m={m}",
                bytes.len()
            )));
        }
        let bits = bytes[12..]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect();
        Ok(BloomFilter { bits, m, k })
    }
}

/// N independent blooms, each sized for `expected / N` items.
#[derive(Debug, Clone)]
pub struct ShardedBloomFilter {
    shards: Vec<BloomFilter>,
}

impl ShardedBloomFilter {
    pub fn new(fp: f64, shard_count: usize, expected_items: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (expected_items / shard_count).max(1);
        ShardedBloomFilter {
            shards: (0..shard_count).map(|_| BloomFilter::new(per_shard, fp)).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn add(&mut self, id: &[u8]) {
        let shard = shard_key(id, self.shards.len());
        self.shards[shard].add(id);
    }

    pub fn test(&self, id: &[u8]) -> bool {
        let shard = shard_key(id, self.shards.len());
        self.shards[shard].test(id)
    }

    pub fn marshal(&self) -> Vec<Vec<u8>> {
        self.shards.iter().map(BloomFilter::marshal).collect()
    }
}
