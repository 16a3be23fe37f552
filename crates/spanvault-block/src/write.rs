// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The block write pipeline.
//!
//! Objects arrive in ascending id order. Consecutive objects with the same
//! id are collapsed through the combiner, so ids inside a finished block are
//! unique. Pages stream to the backend as they fill; the index, the bloom
//! shards and finally the meta are written when the stream ends. Nothing is
//! readable until the meta lands, which is why it goes last.

use std::sync::Arc;

use bytes::Bytes;
use spanvault_backend::{
    bloom_name, write_block_meta, AppendTracker, BlockMeta, Encoding, KeyPath, RawWriter,
    NAME_INDEX, NAME_OBJECTS,
};
use spanvault_model::ObjectCombiner;
use uuid::Uuid;

use crate::bloom::ShardedBloomFilter;
use crate::index::{IndexWriter, Record};
use crate::object::{encode_object, encoded_object_len};
use crate::page::frame_page;
use crate::BlockError;

#[derive(Debug, Clone)]
pub struct BlockConfig {
    pub target_page_size: usize,
    pub encoding: Encoding,
    pub bloom_shard_count: usize,
    pub bloom_false_positive: f64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        BlockConfig {
            target_page_size: 1024 * 1024,
            encoding: Encoding::Zstd,
            bloom_shard_count: 10,
            bloom_false_positive: 0.01,
        }
    }
}

pub struct BlockWriter {
    writer: Arc<dyn RawWriter>,
    keypath: KeyPath,
    meta: BlockMeta,
    cfg: BlockConfig,
    combiner: Arc<dyn ObjectCombiner>,

    bloom: ShardedBloomFilter,
    index: IndexWriter,
    page_buf: Vec<u8>,
    page_last_id: Vec<u8>,
    data_offset: u64,
    tracker: Option<AppendTracker>,
    pending: Option<(Vec<u8>, Vec<u8>)>,
}

impl BlockWriter {
    pub fn new(
        writer: Arc<dyn RawWriter>,
        tenant: &str,
        block_id: Uuid,
        data_encoding: &str,
        cfg: BlockConfig,
        combiner: Arc<dyn ObjectCombiner>,
        estimated_objects: usize,
    ) -> Self {
        let meta = BlockMeta::new(
            tenant,
            block_id,
            cfg.encoding,
            data_encoding,
            cfg.bloom_shard_count as u32,
            cfg.bloom_false_positive,
        );
        BlockWriter {
            writer,
            keypath: KeyPath::from_block(tenant, block_id),
            bloom: ShardedBloomFilter::new(
                cfg.bloom_false_positive,
                cfg.bloom_shard_count,
                estimated_objects,
            ),
            meta,
            cfg,
            combiner,
            index: IndexWriter::new(),
            page_buf: Vec::new(),
            page_last_id: Vec::new(),
            data_offset: 0,
            tracker: None,
            pending: None,
        }
    }

    /// Appends one object. Ids must be non-decreasing; equal ids are combined.
    pub async fn append(&mut self, id: &[u8], obj: &[u8]) -> Result<(), BlockError> {
        match self.pending.take() {
            None => {
                self.pending = Some((id.to_vec(), obj.to_vec()));
            }
            Some((pending_id, pending_obj)) => {
                if id == pending_id.as_slice() {
                    let combined =
                        self.combiner
                            .combine(&self.meta.data_encoding, &pending_obj, obj)?;
                    self.pending = Some((pending_id, combined));
                } else {
                    if id < pending_id.as_slice() {
                        return Err(BlockError::OutOfOrder);
                    }
                    self.write_object(&pending_id, &pending_obj).await?;
                    self.pending = Some((id.to_vec(), obj.to_vec()));
                }
            }
        }
        Ok(())
    }

    async fn write_object(&mut self, id: &[u8], obj: &[u8]) -> Result<(), BlockError> {
        if !self.page_buf.is_empty()
            && self.page_buf.len() + encoded_object_len(id, obj) > self.cfg.target_page_size
        {
            self.cut_page().await?;
        }

        encode_object(&mut self.page_buf, id, obj);
        self.page_last_id = id.to_vec();
        self.bloom.add(id);
        self.meta.object_added(id);
        Ok(())
    }

    async fn cut_page(&mut self) -> Result<(), BlockError> {
        let frame = frame_page(&self.page_buf, self.cfg.encoding)?;
        self.tracker = Some(
            self.writer
                .append(NAME_OBJECTS, &self.keypath, self.tracker, &frame)
                .await?,
        );
        self.index.push(&Record {
            id: self.page_last_id.clone(),
            start: self.data_offset,
            length: frame.len() as u32,
        });
        self.data_offset += frame.len() as u64;
        self.page_buf.clear();
        Ok(())
    }

    /// Flushes the final page and writes index, bloom shards and meta, in
    /// that order. Returns the finished meta.
    pub async fn finish(mut self) -> Result<BlockMeta, BlockError> {
        if let Some((id, obj)) = self.pending.take() {
            self.write_object(&id, &obj).await?;
        }
        if !self.page_buf.is_empty() {
            self.cut_page().await?;
        }

        match self.tracker {
            Some(tracker) => self.writer.close_append(tracker).await?,
            // A block with no objects still gets a readable (empty) data
            // object so the artifact set is complete.
            None => {
                self.writer
                    .write(NAME_OBJECTS, &self.keypath, Bytes::new(), false)
                    .await?
            }
        }
        self.meta.size = self.data_offset;

        let index_bytes = self.index.finish();
        self.writer
            .write(NAME_INDEX, &self.keypath, Bytes::from(index_bytes), false)
            .await?;

        for (i, shard) in self.bloom.marshal().into_iter().enumerate() {
            self.writer
                .write(&bloom_name(i), &self.keypath, Bytes::from(shard), true)
                .await?;
        }

        write_block_meta(self.writer.as_ref(), &self.meta).await?;
        Ok(self.meta)
    }
}

/// Builds a block from an unsorted set of `(id, obj)` objects: sorts by id,
/// dedups through the combiner and runs the write pipeline.
pub async fn write_block_from_objects(
    writer: Arc<dyn RawWriter>,
    tenant: &str,
    block_id: Uuid,
    data_encoding: &str,
    cfg: BlockConfig,
    combiner: Arc<dyn ObjectCombiner>,
    mut objects: Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<BlockMeta, BlockError> {
    objects.sort_by(|a, b| a.0.cmp(&b.0));

    let mut block_writer = BlockWriter::new(
        writer,
        tenant,
        block_id,
        data_encoding,
        cfg,
        combiner,
        objects.len(),
    );
    for (id, obj) in &objects {
        block_writer.append(id, obj).await?;
    }
    block_writer.finish().await
}
