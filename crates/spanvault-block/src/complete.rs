// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A sealed, immutable block held on an ingester's local disk while it waits
//! for upload, and for the handoff window after. Its index stays in memory
//! so local lookups skip the bloom probe entirely.

use std::sync::Arc;

use spanvault_backend::{BlockMeta, KeyPath, RawReader, NAME_INDEX};
use spanvault_model::ObjectCombiner;

use crate::finder::{PagedFinder, PageReader};
use crate::index::IndexReader;
use crate::iter::BlockIterator;
use crate::BlockError;

pub struct CompleteBlock {
    meta: BlockMeta,
    index: IndexReader,
    pages: PageReader,
}

impl CompleteBlock {
    /// Loads a block written to `reader` (typically the ingester's local
    /// block store), pinning its index in memory.
    pub async fn open(reader: Arc<dyn RawReader>, meta: BlockMeta) -> Result<Self, BlockError> {
        let keypath = KeyPath::from_block(&meta.tenant_id, meta.block_id);
        let index_bytes = reader.read(NAME_INDEX, &keypath, false).await?;
        let index = IndexReader::new(index_bytes)?;
        let pages = PageReader::new(reader, keypath, meta.encoding);
        Ok(CompleteBlock { meta, index, pages })
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub async fn find(
        &self,
        id: &[u8],
        combiner: Arc<dyn ObjectCombiner>,
    ) -> Result<Option<Vec<u8>>, BlockError> {
        let finder = PagedFinder::new(
            self.index.clone(),
            self.pages.clone(),
            Some(combiner),
            &self.meta.data_encoding,
        );
        finder.find(id).await
    }

    pub fn iterator(&self) -> BlockIterator {
        BlockIterator::new(self.index.clone(), self.pages.clone())
    }
}
