// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Point lookup inside one block.

use std::sync::Arc;

use spanvault_backend::{
    bloom_name, BlockMeta, Encoding, KeyPath, RawReader, NAME_INDEX, NAME_OBJECTS,
};
use spanvault_model::ObjectCombiner;

use crate::bloom::{shard_key, BloomFilter};
use crate::index::{IndexReader, Record};
use crate::object::ObjectDecoder;
use crate::page::unframe_page;
use crate::BlockError;

/// Fetches and decodes single pages of a block's data object via range reads.
#[derive(Clone)]
pub struct PageReader {
    reader: Arc<dyn RawReader>,
    keypath: KeyPath,
    encoding: Encoding,
}

impl PageReader {
    pub fn new(reader: Arc<dyn RawReader>, keypath: KeyPath, encoding: Encoding) -> Self {
        PageReader {
            reader,
            keypath,
            encoding,
        }
    }

    /// Reads the page a record points at and returns its object stream.
    pub async fn read_page(&self, record: &Record) -> Result<Vec<u8>, BlockError> {
        let mut frame = vec![0u8; record.length as usize];
        self.reader
            .read_range(NAME_OBJECTS, &self.keypath, record.start, &mut frame)
            .await?;
        unframe_page(&frame, self.encoding)
    }
}

/// Finds an object by id using the index and range reads into the data
/// object. If a combiner is set, consecutive records holding the same id
/// (a trace that straddled a page boundary at write time) are combined.
pub struct PagedFinder {
    index: IndexReader,
    pages: PageReader,
    combiner: Option<Arc<dyn ObjectCombiner>>,
    data_encoding: String,
}

impl PagedFinder {
    pub fn new(
        index: IndexReader,
        pages: PageReader,
        combiner: Option<Arc<dyn ObjectCombiner>>,
        data_encoding: &str,
    ) -> Self {
        PagedFinder {
            index,
            pages,
            combiner,
            data_encoding: data_encoding.to_string(),
        }
    }

    pub async fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        let Some((mut record, mut i)) = self.index.find(id) else {
            return Ok(None);
        };

        let mut found: Option<Vec<u8>> = None;
        loop {
            let one = self.find_one(id, &record).await?;

            let Some(combiner) = &self.combiner else {
                return Ok(one);
            };

            found = match (found, one) {
                (None, one) => one,
                (Some(acc), None) => Some(acc),
                (Some(acc), Some(one)) => {
                    Some(combiner.combine(&self.data_encoding, &acc, &one)?)
                }
            };

            // the next record may continue the same id across a page boundary
            i += 1;
            match self.index.at(i) {
                Some(next) if next.id == id => record = next,
                _ => break,
            }
        }

        Ok(found)
    }

    async fn find_one(&self, id: &[u8], record: &Record) -> Result<Option<Vec<u8>>, BlockError> {
        let payload = self.pages.read_page(record).await?;
        for object in ObjectDecoder::new(&payload) {
            let (found_id, obj) = object?;
            if found_id == id {
                return Ok(Some(obj));
            }
        }
        Ok(None)
    }
}

/// Full point-lookup path against a backend block: bloom probe, then index
/// seek, then page fetch. Returns `Ok(None)` when the block does not hold
/// the id; absence is a valid result, not an error.
pub async fn find_in_block(
    reader: Arc<dyn RawReader>,
    meta: &BlockMeta,
    id: &[u8],
    combiner: Arc<dyn ObjectCombiner>,
) -> Result<Option<Vec<u8>>, BlockError> {
    let keypath = KeyPath::from_block(&meta.tenant_id, meta.block_id);

    // one shard fetch per probe; cached because shards are small and hot
    let shard = shard_key(id, meta.bloom_shard_count as usize);
    let shard_bytes = reader.read(&bloom_name(shard), &keypath, true).await?;
    let bloom = BloomFilter::unmarshal(&shard_bytes)?;
    if !bloom.test(id) {
        return Ok(None);
    }

    let index_bytes = reader.read(NAME_INDEX, &keypath, false).await?;
    let index = IndexReader::new(index_bytes)?;
    let pages = PageReader::new(reader, keypath, meta.encoding);
    let finder = PagedFinder::new(index, pages, Some(combiner), &meta.data_encoding);
    finder.find(id).await
}
