// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Iterators over block contents, used by compaction.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use spanvault_model::ObjectCombiner;

use crate::finder::PageReader;
use crate::index::IndexReader;
use crate::object::ObjectDecoder;
use crate::BlockError;

/// Yields `(id, object)` pairs in ascending id order.
#[async_trait]
pub trait ObjectIterator: Send {
    async fn next_object(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BlockError>;
}

/// Iterates one block page by page via its index records.
pub struct BlockIterator {
    index: IndexReader,
    pages: PageReader,
    record_index: usize,
    current: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl BlockIterator {
    pub fn new(index: IndexReader, pages: PageReader) -> Self {
        BlockIterator {
            index,
            pages,
            record_index: 0,
            current: VecDeque::new(),
        }
    }
}

#[async_trait]
impl ObjectIterator for BlockIterator {
    async fn next_object(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BlockError> {
        loop {
            if let Some(pair) = self.current.pop_front() {
                return Ok(Some(pair));
            }

            let Some(record) = self.index.at(self.record_index) else {
                return Ok(None);
            };
            self.record_index += 1;

            let payload = self.pages.read_page(&record).await?;
            for object in ObjectDecoder::new(&payload) {
                self.current.push_back(object?);
            }
        }
    }
}

struct Bookmark {
    iter: Box<dyn ObjectIterator>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl Bookmark {
    async fn fill(&mut self) -> Result<(), BlockError> {
        if self.current.is_none() && !self.done {
            match self.iter.next_object().await? {
                Some(pair) => self.current = Some(pair),
                None => self.done = true,
            }
        }
        Ok(())
    }
}

/// K-way merge over per-block iterators, ascending by id. When several
/// inputs carry the same id the objects are reduced through the combiner,
/// which is how compaction dedups overlapping traces.
pub struct MultiBlockIterator {
    bookmarks: Vec<Bookmark>,
    combiner: Arc<dyn ObjectCombiner>,
    data_encoding: String,
}

impl MultiBlockIterator {
    pub fn new(
        iters: Vec<Box<dyn ObjectIterator>>,
        combiner: Arc<dyn ObjectCombiner>,
        data_encoding: &str,
    ) -> Self {
        MultiBlockIterator {
            bookmarks: iters
                .into_iter()
                .map(|iter| Bookmark {
                    iter,
                    current: None,
                    done: false,
                })
                .collect(),
            combiner,
            data_encoding: data_encoding.to_string(),
        }
    }
}

#[async_trait]
impl ObjectIterator for MultiBlockIterator {
    async fn next_object(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BlockError> {
        for bookmark in &mut self.bookmarks {
            bookmark.fill().await?;
        }

        // lowest id across bookmarks wins; input count per job is small
        // enough that a linear scan beats heap bookkeeping
        let lowest = self
            .bookmarks
            .iter()
            .filter_map(|b| b.current.as_ref().map(|(id, _)| id.clone()))
            .min();
        let Some(lowest) = lowest else {
            return Ok(None);
        };

        let mut combined: Option<Vec<u8>> = None;
        for bookmark in &mut self.bookmarks {
            let matches = bookmark
                .current
                .as_ref()
                .is_some_and(|(id, _)| *id == lowest);
            if !matches {
                continue;
            }
            let (_, obj) = bookmark.current.take().expect("bookmark current checked above");
            combined = Some(match combined {
                None => obj,
                Some(acc) => self.combiner.combine(&self.data_encoding, &acc, &obj)?,
            });
        }

        Ok(combined.map(|obj| (lowest, obj)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_backend::{Encoding, KeyPath, MemoryBackend, RawReader, NAME_INDEX};
    use spanvault_model::{TraceCombiner, DATA_ENCODING_PROTO};
    use uuid::Uuid;

    use crate::write::{write_block_from_objects, BlockConfig};

    fn id(n: u8) -> Vec<u8> {
        let mut v = vec![0u8; 16];
        v[15] = n;
        v
    }

    async fn block_iter(
        backend: Arc<MemoryBackend>,
        objects: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> BlockIterator {
        let block_id = Uuid::new_v4();
        let meta = write_block_from_objects(
            backend.clone(),
            "t",
            block_id,
            DATA_ENCODING_PROTO,
            BlockConfig {
                target_page_size: 48,
                encoding: Encoding::None,
                bloom_shard_count: 2,
                bloom_false_positive: 0.01,
            },
            Arc::new(TraceCombiner),
            objects,
        )
        .await
        .unwrap();

        let keypath = KeyPath::from_block("t", meta.block_id);
        let index = IndexReader::new(backend.read(NAME_INDEX, &keypath, false).await.unwrap())
            .unwrap();
        let pages = PageReader::new(backend, keypath, meta.encoding);
        BlockIterator::new(index, pages)
    }

    #[tokio::test]
    async fn test_block_iterator_yields_all_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        let objects: Vec<_> = (1..=9u8).map(|n| (id(n), vec![n; 20])).collect();
        let mut iter = block_iter(backend, objects).await;

        let mut seen = Vec::new();
        while let Some((id, _)) = iter.next_object().await.unwrap() {
            seen.push(id[15]);
        }
        assert_eq!(seen, (1..=9u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_multi_block_merge_orders_and_dedups() {
        use prost::Message;
        use spanvault_model::{ResourceSpans, ScopeSpans, Span, Trace};

        let trace_obj = |trace_n: u8, span_n: u8| {
            Trace {
                batches: vec![ResourceSpans {
                    resource: None,
                    scope_spans: vec![ScopeSpans {
                        scope: None,
                        spans: vec![Span {
                            trace_id: id(trace_n),
                            span_id: vec![span_n; 8],
                            ..Default::default()
                        }],
                    }],
                }],
            }
            .encode_to_vec()
        };

        let backend = Arc::new(MemoryBackend::new());
        // block A: traces 1, 3 (span 1); block B: traces 2, 3 (span 2)
        let a = block_iter(
            backend.clone(),
            vec![(id(1), trace_obj(1, 1)), (id(3), trace_obj(3, 1))],
        )
        .await;
        let b = block_iter(
            backend.clone(),
            vec![(id(2), trace_obj(2, 2)), (id(3), trace_obj(3, 2))],
        )
        .await;

        let mut merged = MultiBlockIterator::new(
            vec![Box::new(a), Box::new(b)],
            Arc::new(TraceCombiner),
            DATA_ENCODING_PROTO,
        );

        let (first, _) = merged.next_object().await.unwrap().unwrap();
        assert_eq!(first, id(1));
        let (second, _) = merged.next_object().await.unwrap().unwrap();
        assert_eq!(second, id(2));

        let (third, obj) = merged.next_object().await.unwrap().unwrap();
        assert_eq!(third, id(3));
        let combined = Trace::decode(obj.as_slice()).unwrap();
        assert_eq!(combined.span_count(), 2);

        assert!(merged.next_object().await.unwrap().is_none());
    }
}
