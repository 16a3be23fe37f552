// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant state inside one ingester: the live trace map, the open head
//! block and the sealed blocks still on local disk.
//!
//! One lock guards all of it. The critical section of a push is the append
//! itself (bounded by the append size plus one WAL write); block reads
//! happen outside the lock against snapshots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spanvault_backend::{BlockMeta, LocalBackend};
use spanvault_block::{
    write_block_from_objects, BlockConfig, CompleteBlock, HeadBlock, SealedWal,
};
use spanvault_model::overrides::Limits;
use spanvault_model::{ObjectCombiner, DATA_ENCODING_PROTO};
use tracing::debug;

use crate::metrics::{METRIC_LIVE_TRACES, METRIC_TRACES_CREATED};
use crate::IngestError;

pub struct LiveTrace {
    pub trace_id: Vec<u8>,
    pub batches: Vec<Vec<u8>>,
    pub size_bytes: usize,
    pub last_append: Instant,
    pub created_at: Instant,
}

struct LocalBlockEntry {
    block: Arc<CompleteBlock>,
    flushed_at: Option<Instant>,
}

struct InstanceInner {
    live_traces: HashMap<Vec<u8>, LiveTrace>,
    head: HeadBlock,
    complete_blocks: Vec<LocalBlockEntry>,
}

pub struct TenantInstance {
    tenant: String,
    wal_dir: PathBuf,
    local: Arc<LocalBackend>,
    combiner: Arc<dyn ObjectCombiner>,
    block_cfg: BlockConfig,
    inner: Mutex<InstanceInner>,
}

impl TenantInstance {
    pub fn new(
        tenant: &str,
        wal_dir: PathBuf,
        local: Arc<LocalBackend>,
        combiner: Arc<dyn ObjectCombiner>,
        block_cfg: BlockConfig,
    ) -> Result<Self, IngestError> {
        let head = HeadBlock::new(&wal_dir, tenant)?;
        Ok(TenantInstance {
            tenant: tenant.to_string(),
            wal_dir,
            local,
            combiner,
            block_cfg,
            inner: Mutex::new(InstanceInner {
                live_traces: HashMap::new(),
                head,
                complete_blocks: Vec::new(),
            }),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Accepts one pushed fragment: durable in the head WAL and buffered in
    /// the live trace, in that order of importance. A fragment that would
    /// blow the per-trace byte limit is rejected before any WAL write and
    /// the live trace stays usable.
    pub fn push_bytes(
        &self,
        trace_id: &[u8],
        trace_bytes: &[u8],
        limits: &Limits,
    ) -> Result<(), IngestError> {
        let mut inner = self.inner.lock();

        if !inner.live_traces.contains_key(trace_id)
            && limits.max_local_traces_per_tenant > 0
            && inner.live_traces.len() >= limits.max_local_traces_per_tenant
        {
            return Err(IngestError::LiveTracesExceeded {
                tenant: self.tenant.clone(),
                max: limits.max_local_traces_per_tenant,
            });
        }

        if let Some(live) = inner.live_traces.get(trace_id) {
            if limits.max_bytes_per_trace > 0
                && live.size_bytes + trace_bytes.len() > limits.max_bytes_per_trace
            {
                return Err(IngestError::TraceTooLarge {
                    max: limits.max_bytes_per_trace,
                    size: trace_bytes.len(),
                });
            }
        } else if limits.max_bytes_per_trace > 0 && trace_bytes.len() > limits.max_bytes_per_trace
        {
            return Err(IngestError::TraceTooLarge {
                max: limits.max_bytes_per_trace,
                size: trace_bytes.len(),
            });
        }

        inner.head.append_fragment(trace_id, trace_bytes)?;

        let now = Instant::now();
        let live = inner
            .live_traces
            .entry(trace_id.to_vec())
            .or_insert_with(|| {
                METRIC_TRACES_CREATED.with_label_values(&[self.tenant.as_str()]).inc();
                LiveTrace {
                    trace_id: trace_id.to_vec(),
                    batches: Vec::new(),
                    size_bytes: 0,
                    last_append: now,
                    created_at: now,
                }
            });
        live.batches.push(trace_bytes.to_vec());
        live.size_bytes += trace_bytes.len();
        live.last_append = now;

        METRIC_LIVE_TRACES
            .with_label_values(&[self.tenant.as_str()])
            .set(inner.live_traces.len() as i64);
        Ok(())
    }

    /// Number of live traces, for tests and metrics.
    pub fn live_trace_count(&self) -> usize {
        self.inner.lock().live_traces.len()
    }

    /// Evicts live traces idle longer than `idle_period` or older than
    /// `max_age` into the head block as complete objects. Returns how many
    /// were cut.
    pub fn cut_idle_traces(
        &self,
        idle_period: Duration,
        max_age: Duration,
    ) -> Result<usize, IngestError> {
        let now = Instant::now();
        self.cut_matching(|live| {
            now.duration_since(live.last_append) > idle_period
                || now.duration_since(live.created_at) > max_age
        })
    }

    /// Force-evicts every live trace. Run before sealing so the sealed head
    /// holds the whole acknowledged write set.
    pub fn cut_all_traces(&self) -> Result<usize, IngestError> {
        self.cut_matching(|_| true)
    }

    fn cut_matching(
        &self,
        predicate: impl Fn(&LiveTrace) -> bool,
    ) -> Result<usize, IngestError> {
        let mut inner = self.inner.lock();

        let ids: Vec<Vec<u8>> = inner
            .live_traces
            .values()
            .filter(|live| predicate(live))
            .map(|live| live.trace_id.clone())
            .collect();

        for id in &ids {
            let live = inner
                .live_traces
                .remove(id)
                .expect("id collected from the map above");
            let mut combined: Vec<u8> = Vec::new();
            for batch in &live.batches {
                combined = self
                    .combiner
                    .combine(DATA_ENCODING_PROTO, &combined, batch)?;
            }
            inner.head.push_complete_object(live.trace_id, combined);
        }

        METRIC_LIVE_TRACES
            .with_label_values(&[self.tenant.as_str()])
            .set(inner.live_traces.len() as i64);
        Ok(ids.len())
    }

    /// True when anything acknowledged is not yet in a complete block.
    pub fn has_pending_data(&self) -> bool {
        let inner = self.inner.lock();
        !inner.live_traces.is_empty()
            || inner.head.wal_size() > 0
            || inner.head.object_count() > 0
    }

    /// True when the head has outgrown its byte or age budget.
    pub fn should_rotate(&self, max_block_bytes: u64, max_block_duration: Duration) -> bool {
        let inner = self.inner.lock();
        if inner.head.wal_size() == 0 && inner.head.object_count() == 0 {
            return false;
        }
        inner.head.wal_size() >= max_block_bytes || inner.head.age() >= max_block_duration
    }

    /// Seals the current head and opens a fresh one. Call
    /// [`TenantInstance::cut_all_traces`] first; sealing asserts nothing is
    /// left live so no acknowledged byte can be stranded in memory.
    pub fn rotate(&self) -> Result<SealedWal, IngestError> {
        let new_head = HeadBlock::new(&self.wal_dir, &self.tenant)?;
        let old_head = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.live_traces.is_empty(), "rotate before cutting live traces");
            std::mem::replace(&mut inner.head, new_head)
        };
        debug!(tenant = %self.tenant, block = %old_head.block_id(), "sealing head block");
        Ok(old_head.seal()?)
    }

    /// Builds the complete block for a sealed head on local disk, registers
    /// it for queries, and only then removes the WAL file.
    pub async fn complete_sealed(&self, sealed: SealedWal) -> Result<BlockMeta, IngestError> {
        let meta = write_block_from_objects(
            self.local.clone(),
            &self.tenant,
            sealed.block_id,
            DATA_ENCODING_PROTO,
            self.block_cfg.clone(),
            self.combiner.clone(),
            sealed.objects,
        )
        .await?;

        let block = CompleteBlock::open(self.local.clone(), meta.clone()).await?;
        self.add_complete_block(Arc::new(block));

        // the block is durable; the sealed wal has served its purpose
        std::fs::remove_file(&sealed.path).map_err(spanvault_block::BlockError::Io)?;
        Ok(meta)
    }

    /// Registers an already-built local block (replay, tests).
    pub fn add_complete_block(&self, block: Arc<CompleteBlock>) {
        self.inner.lock().complete_blocks.push(LocalBlockEntry {
            block,
            flushed_at: None,
        });
    }

    pub fn mark_flushed(&self, block_id: uuid::Uuid) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.complete_blocks {
            if entry.block.meta().block_id == block_id {
                entry.flushed_at = Some(Instant::now());
            }
        }
    }

    /// Drops local blocks that have been flushed for longer than
    /// `complete_block_timeout` (the handoff window) and deletes their
    /// artifacts from local disk.
    pub fn clear_flushed_blocks(
        &self,
        complete_block_timeout: Duration,
    ) -> Result<Vec<BlockMeta>, IngestError> {
        let now = Instant::now();
        let removed: Vec<BlockMeta> = {
            let mut inner = self.inner.lock();
            let (stale, keep): (Vec<LocalBlockEntry>, Vec<LocalBlockEntry>) = inner
                .complete_blocks
                .drain(..)
                .partition(|entry| match entry.flushed_at {
                    Some(at) => now.duration_since(at) > complete_block_timeout,
                    None => false,
                });
            inner.complete_blocks = keep;
            stale.into_iter().map(|e| e.block.meta().clone()).collect()
        };

        for meta in &removed {
            let dir = self
                .local
                .root()
                .join(&meta.tenant_id)
                .join(meta.block_id.to_string());
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(IngestError::Block(spanvault_block::BlockError::Io(e)));
                }
            }
        }
        Ok(removed)
    }

    /// Everything this instance knows about a trace id, without touching the
    /// backend: live buffer fragments, head block objects, and a snapshot of
    /// local complete blocks to search outside the lock.
    pub fn gather_local(&self, trace_id: &[u8]) -> (Vec<Vec<u8>>, Vec<Arc<CompleteBlock>>) {
        let inner = self.inner.lock();

        let mut fragments: Vec<Vec<u8>> = Vec::new();
        if let Some(live) = inner.live_traces.get(trace_id) {
            fragments.extend(live.batches.iter().cloned());
        }
        for obj in inner.head.find_objects(trace_id) {
            fragments.push(obj.to_vec());
        }

        let blocks = inner
            .complete_blocks
            .iter()
            .map(|e| e.block.clone())
            .collect();
        (fragments, blocks)
    }

    /// Metas of local complete blocks that have not been uploaded yet.
    pub fn unflushed_blocks(&self) -> Vec<BlockMeta> {
        self.inner
            .lock()
            .complete_blocks
            .iter()
            .filter(|e| e.flushed_at.is_none())
            .map(|e| e.block.meta().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_backend::Encoding;
    use spanvault_model::TraceCombiner;

    fn test_instance(dir: &std::path::Path) -> TenantInstance {
        let wal_dir = dir.join("wal");
        std::fs::create_dir_all(&wal_dir).unwrap();
        let local = Arc::new(LocalBackend::new(dir.join("blocks")).unwrap());
        TenantInstance::new(
            "t",
            wal_dir,
            local,
            Arc::new(TraceCombiner),
            BlockConfig {
                target_page_size: 128,
                encoding: Encoding::None,
                bloom_shard_count: 2,
                bloom_false_positive: 0.01,
            },
        )
        .unwrap()
    }

    fn id(n: u8) -> Vec<u8> {
        let mut v = vec![0u8; 16];
        v[15] = n;
        v
    }

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn test_live_traces_limit() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());
        let limits = Limits {
            max_local_traces_per_tenant: 2,
            ..Limits::default()
        };

        instance.push_bytes(&id(1), b"a", &limits).unwrap();
        instance.push_bytes(&id(2), b"b", &limits).unwrap();
        let err = instance.push_bytes(&id(3), b"c", &limits).unwrap_err();
        assert!(matches!(err, IngestError::LiveTracesExceeded { .. }));
        assert!(err.to_string().starts_with("LIVE_TRACES_EXCEEDED"));

        // appends to existing traces still work at the cap
        instance.push_bytes(&id(1), b"more", &limits).unwrap();
    }

    #[test]
    fn test_trace_too_large_keeps_live_trace_usable() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());
        let limits = Limits {
            max_bytes_per_trace: 10,
            ..Limits::default()
        };

        instance.push_bytes(&id(1), b"12345", &limits).unwrap();
        let wal_size_before = {
            let inner = instance.inner.lock();
            inner.head.wal_size()
        };

        let err = instance
            .push_bytes(&id(1), b"1234567", &limits)
            .unwrap_err();
        assert!(err.to_string().starts_with("TRACE_TOO_LARGE"));

        // the rejected append never reached the wal
        let wal_size_after = {
            let inner = instance.inner.lock();
            inner.head.wal_size()
        };
        assert_eq!(wal_size_before, wal_size_after);

        // correctly sized appends keep flowing
        instance.push_bytes(&id(1), b"12345", &limits).unwrap();
        assert_eq!(instance.live_trace_count(), 1);
    }

    #[test]
    fn test_cut_idle_traces() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());

        instance.push_bytes(&id(1), b"x", &limits()).unwrap();
        instance.push_bytes(&id(2), b"y", &limits()).unwrap();

        // nothing is idle yet
        let cut = instance
            .cut_idle_traces(Duration::from_secs(60), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(cut, 0);
        assert_eq!(instance.live_trace_count(), 2);

        // zero idle period cuts everything
        let cut = instance
            .cut_idle_traces(Duration::ZERO, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(cut, 2);
        assert_eq!(instance.live_trace_count(), 0);

        // cut objects remain findable through the head
        let (fragments, _) = instance.gather_local(&id(1));
        assert_eq!(fragments.len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());

        instance.push_bytes(&id(1), b"aa", &limits()).unwrap();
        instance.push_bytes(&id(2), b"bb", &limits()).unwrap();
        instance.cut_all_traces().unwrap();

        let sealed = instance.rotate().unwrap();
        assert!(sealed.path.exists());

        let meta = instance.complete_sealed(sealed).await.unwrap();
        assert_eq!(meta.total_objects, 2);

        // wal is gone, block is queryable
        let wal_dir = dir.path().join("wal");
        let leftover: Vec<_> = std::fs::read_dir(&wal_dir)
            .unwrap()
            .filter_map(|e| {
                let name = e.unwrap().file_name().to_string_lossy().into_owned();
                name.contains("sealed").then_some(name)
            })
            .collect();
        assert!(leftover.is_empty(), "sealed wal not removed: {leftover:?}");

        let (fragments, blocks) = instance.gather_local(&id(1));
        assert!(fragments.is_empty());
        assert_eq!(blocks.len(), 1);
        let found = blocks[0]
            .find(&id(1), Arc::new(TraceCombiner))
            .await
            .unwrap();
        assert_eq!(found, Some(b"aa".to_vec()));
    }

    #[test]
    fn test_clear_flushed_blocks_honors_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let instance = test_instance(dir.path());

        // a block never flushed is never cleared
        futures_block_on(async {
            instance.push_bytes(&id(1), b"aa", &limits()).unwrap();
            instance.cut_all_traces().unwrap();
            let sealed = instance.rotate().unwrap();
            instance.complete_sealed(sealed).await.unwrap();
        });

        let removed = instance.clear_flushed_blocks(Duration::ZERO).unwrap();
        assert!(removed.is_empty());

        let block_id = instance.unflushed_blocks()[0].block_id;
        instance.mark_flushed(block_id);
        assert!(instance.unflushed_blocks().is_empty());

        // still inside the handoff window
        let removed = instance
            .clear_flushed_blocks(Duration::from_secs(3600))
            .unwrap();
        assert!(removed.is_empty());

        // past the window
        let removed = instance.clear_flushed_blocks(Duration::ZERO).unwrap();
        assert_eq!(removed.len(), 1);
        let (_, blocks) = instance.gather_local(&id(1));
        assert!(blocks.is_empty());
    }

    fn futures_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
