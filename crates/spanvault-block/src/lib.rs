// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The immutable block format and the write-ahead log that feeds it.
//!
//! A block is four artifacts: a paged `data` object, a sorted fixed-width
//! `index`, a sharded bloom filter (`bloom-0..bloom-(N-1)`) and `meta.json`.
//! Blocks are produced by ingester flushes and compactor merges, are never
//! mutated, and are deleted only by retention.

pub mod bloom;
pub mod complete;
pub mod finder;
pub mod head;
pub mod index;
pub mod iter;
pub mod object;
pub mod page;
pub mod wal;
pub mod write;

pub use bloom::{shard_key, ShardedBloomFilter};
pub use complete::CompleteBlock;
pub use finder::{find_in_block, PagedFinder, PageReader};
pub use head::{HeadBlock, SealedWal};
pub use index::{IndexReader, IndexWriter, Record, RECORD_SIZE};
pub use iter::{BlockIterator, MultiBlockIterator, ObjectIterator};
pub use wal::Wal;
pub use write::{write_block_from_objects, BlockConfig, BlockWriter};

use spanvault_backend::BackendError;
use spanvault_model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("block io: {0}")]
    Io(#[from] std::io::Error),

    #[error("objects must be appended in ascending id order")]
    OutOfOrder,

    #[error("corrupt block: {0}")]
    Corrupt(String),
}
