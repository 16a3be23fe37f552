// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compaction proper: blocklist polling, job selection, and the k-way merge
//! that turns many small blocks into fewer larger ones.
//!
//! Coordination is ring-based: a compactor only takes jobs whose first
//! input block it owns. Membership changes mid-selection can duplicate a
//! job across compactors; duplicate outputs are reconciled at query time by
//! the combiner, so the race costs work, not correctness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use spanvault_backend::{
    list_blocks, list_tenants, read_block_meta, BackendError, BlockMeta, KeyPath, RawReader,
    RawWriter, NAME_INDEX,
};
use spanvault_block::{
    BlockConfig, BlockIterator, BlockWriter, IndexReader, MultiBlockIterator, ObjectIterator,
    PageReader,
};
use spanvault_model::overrides::Overrides;
use spanvault_model::{token_for_bytes, ObjectCombiner};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::{METRIC_BLOCKS_COMPACTED, METRIC_BLOCKS_RETIRED};
use crate::sweep::{delete_block, read_tombstone, write_tombstone};
use crate::CompactError;

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Blocks at or above this size are left alone.
    pub max_compaction_input_bytes: u64,
    /// Max input blocks per job.
    pub max_inputs_per_job: usize,
    /// Max objects per output block before splitting.
    pub max_compaction_objects: u64,
    /// Two candidate blocks join a job when their time ranges are within
    /// this distance.
    pub compaction_window: Duration,
    /// How long a tombstoned block's artifacts linger for late readers.
    pub deletion_grace: Duration,
    /// How often the per-tenant blocklist is re-polled.
    pub blocklist_poll: Duration,
    pub block: BlockConfig,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        CompactorConfig {
            max_compaction_input_bytes: 100 * 1024 * 1024,
            max_inputs_per_job: 4,
            max_compaction_objects: 1_000_000,
            compaction_window: Duration::from_secs(4 * 3600),
            deletion_grace: Duration::from_secs(15 * 60),
            blocklist_poll: Duration::from_secs(5 * 60),
            block: BlockConfig::default(),
        }
    }
}

pub struct Compactor {
    cfg: CompactorConfig,
    instance_id: String,
    ring: spanvault_ring::Ring,
    store_reader: Arc<dyn RawReader>,
    store_writer: Arc<dyn RawWriter>,
    combiner: Arc<dyn ObjectCombiner>,
    overrides: Arc<Overrides>,
    /// RCU snapshot per tenant: readers clone the Arc, the poller swaps it.
    blocklist: RwLock<HashMap<String, Arc<Vec<BlockMeta>>>>,
    cancel: CancellationToken,
}

impl Compactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: CompactorConfig,
        instance_id: &str,
        ring: spanvault_ring::Ring,
        store_reader: Arc<dyn RawReader>,
        store_writer: Arc<dyn RawWriter>,
        combiner: Arc<dyn ObjectCombiner>,
        overrides: Arc<Overrides>,
    ) -> Arc<Self> {
        Arc::new(Compactor {
            cfg,
            instance_id: instance_id.to_string(),
            ring,
            store_reader,
            store_writer,
            combiner,
            overrides,
            blocklist: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The main loop: poll, compact, sweep, sleep.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.blocklist_poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "compaction cycle failed");
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// One full cycle over every tenant. Public so tests and the single
    /// binary can drive compaction deterministically.
    pub async fn run_once(&self) -> Result<(), CompactError> {
        self.poll_blocklist().await?;

        let tenants: Vec<String> = self.blocklist.read().keys().cloned().collect();
        for tenant in tenants {
            if let Err(e) = self.compact_tenant(&tenant).await {
                error!(tenant = %tenant, error = %e, "tenant compaction failed");
            }
            if let Err(e) = self.sweep_tenant(&tenant).await {
                error!(tenant = %tenant, error = %e, "tenant sweep failed");
            }
        }
        Ok(())
    }

    /// Re-reads every tenant's block metas and swaps the snapshots.
    pub async fn poll_blocklist(&self) -> Result<(), CompactError> {
        let mut new_list: HashMap<String, Arc<Vec<BlockMeta>>> = HashMap::new();

        for tenant in list_tenants(self.store_reader.as_ref()).await? {
            let mut metas = Vec::new();
            for block_id in list_blocks(self.store_reader.as_ref(), &tenant).await? {
                match read_block_meta(self.store_reader.as_ref(), &tenant, block_id).await {
                    Ok(meta) => metas.push(meta),
                    // being written or being deleted; next poll decides
                    Err(BackendError::DoesNotExist) => continue,
                    Err(e) => {
                        warn!(tenant = %tenant, block = %block_id, error = %e, "meta read failed");
                        continue;
                    }
                }
            }
            metas.sort_by_key(|m| m.start_time);
            new_list.insert(tenant, Arc::new(metas));
        }

        *self.blocklist.write() = new_list;
        Ok(())
    }

    pub fn blocklist_for(&self, tenant: &str) -> Arc<Vec<BlockMeta>> {
        self.blocklist
            .read()
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    async fn compact_tenant(&self, tenant: &str) -> Result<(), CompactError> {
        let metas = self.blocklist_for(tenant);

        let mut candidates = Vec::new();
        for meta in metas.iter() {
            if meta.size >= self.cfg.max_compaction_input_bytes {
                continue;
            }
            if read_tombstone(self.store_reader.as_ref(), tenant, meta.block_id)
                .await?
                .is_some()
            {
                continue;
            }
            candidates.push(meta.clone());
        }

        for job in self.select_jobs(&candidates) {
            if !self.owns_job(&job) {
                continue;
            }
            self.compact_job(tenant, &job).await?;
        }
        Ok(())
    }

    /// Greedy grouping of time-adjacent small blocks, already sorted by
    /// start time.
    fn select_jobs(&self, candidates: &[BlockMeta]) -> Vec<Vec<BlockMeta>> {
        let window = chrono::Duration::from_std(self.cfg.compaction_window)
            .unwrap_or_else(|_| chrono::Duration::hours(4));

        let mut jobs = Vec::new();
        let mut current: Vec<BlockMeta> = Vec::new();

        for meta in candidates {
            match current.last() {
                None => current.push(meta.clone()),
                Some(last) => {
                    let adjacent = meta.start_time <= last.end_time + window;
                    if adjacent && current.len() < self.cfg.max_inputs_per_job {
                        current.push(meta.clone());
                    } else {
                        if current.len() > 1 {
                            jobs.push(std::mem::take(&mut current));
                        } else {
                            current.clear();
                        }
                        current.push(meta.clone());
                    }
                }
            }
        }
        if current.len() > 1 {
            jobs.push(current);
        }
        jobs
    }

    /// Ownership by the first input's block id through the compactor ring.
    /// A lone compactor (or an empty ring in single-binary mode) owns
    /// everything.
    fn owns_job(&self, job: &[BlockMeta]) -> bool {
        let token = token_for_bytes(job[0].block_id.as_bytes());
        match self.ring.get(token, spanvault_ring::Op::Read) {
            Ok(replicas) => replicas[0].id == self.instance_id,
            Err(_) => true,
        }
    }

    async fn compact_job(&self, tenant: &str, inputs: &[BlockMeta]) -> Result<(), CompactError> {
        let data_encoding = inputs[0].data_encoding.clone();
        for meta in inputs {
            if meta.data_encoding != data_encoding {
                return Err(CompactError::MixedDataEncoding(
                    data_encoding,
                    meta.data_encoding.clone(),
                ));
            }
        }

        info!(
            tenant = %tenant,
            inputs = inputs.len(),
            first = %inputs[0].block_id,
            "starting compaction job"
        );

        let mut iters: Vec<Box<dyn ObjectIterator>> = Vec::with_capacity(inputs.len());
        let total_objects: u64 = inputs.iter().map(|m| m.total_objects).sum();
        for meta in inputs {
            let keypath = KeyPath::from_block(tenant, meta.block_id);
            let index_bytes = self
                .store_reader
                .read(NAME_INDEX, &keypath, false)
                .await
                .map_err(CompactError::Backend)?;
            let index = IndexReader::new(index_bytes)?;
            let pages = PageReader::new(self.store_reader.clone(), keypath, meta.encoding);
            iters.push(Box::new(BlockIterator::new(index, pages)));
        }
        let mut merged = MultiBlockIterator::new(iters, self.combiner.clone(), &data_encoding);

        // write outputs, splitting by object count
        let mut writer: Option<BlockWriter> = None;
        let mut written_in_block = 0u64;
        let mut outputs = 0usize;
        while let Some((id, obj)) = merged.next_object().await? {
            if writer.is_none() {
                writer = Some(BlockWriter::new(
                    self.store_writer.clone(),
                    tenant,
                    Uuid::new_v4(),
                    &data_encoding,
                    self.cfg.block.clone(),
                    self.combiner.clone(),
                    total_objects as usize,
                ));
                written_in_block = 0;
            }
            writer
                .as_mut()
                .expect("writer created above")
                .append(&id, &obj)
                .await?;
            written_in_block += 1;

            if written_in_block >= self.cfg.max_compaction_objects {
                let meta = writer.take().expect("writer present").finish().await?;
                debug!(block = %meta.block_id, objects = meta.total_objects, "compaction output cut");
                outputs += 1;
            }
        }
        if let Some(writer) = writer {
            let meta = writer.finish().await?;
            debug!(block = %meta.block_id, objects = meta.total_objects, "compaction output cut");
            outputs += 1;
        }

        // outputs are durable; retire the inputs behind the grace window
        for meta in inputs {
            write_tombstone(self.store_writer.as_ref(), tenant, meta.block_id).await?;
        }
        METRIC_BLOCKS_COMPACTED
            .with_label_values(&[tenant])
            .inc_by(inputs.len() as u64);
        info!(tenant = %tenant, inputs = inputs.len(), outputs, "compaction job done");
        Ok(())
    }

    /// Retention plus tombstone collection for one tenant.
    pub async fn sweep_tenant(&self, tenant: &str) -> Result<(), CompactError> {
        let retention = self.overrides.limits(tenant).block_retention;
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(14));
        let grace = chrono::Duration::from_std(self.cfg.deletion_grace)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let now = Utc::now();

        for meta in self.blocklist_for(tenant).iter() {
            let tombstone =
                read_tombstone(self.store_reader.as_ref(), tenant, meta.block_id).await?;

            match tombstone {
                Some(tombstone) => {
                    if now - tombstone.deleted_time > grace {
                        info!(tenant = %tenant, block = %meta.block_id, "deleting block past grace");
                        delete_block(
                            self.store_reader.as_ref(),
                            self.store_writer.as_ref(),
                            tenant,
                            meta.block_id,
                        )
                        .await?;
                        METRIC_BLOCKS_RETIRED.with_label_values(&[tenant]).inc();
                    }
                }
                None => {
                    if now - meta.end_time > retention {
                        info!(tenant = %tenant, block = %meta.block_id, "block past retention");
                        write_tombstone(self.store_writer.as_ref(), tenant, meta.block_id)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use spanvault_backend::{Encoding, MemoryBackend};
    use spanvault_block::{find_in_block, write_block_from_objects};
    use spanvault_model::{
        ResourceSpans, ScopeSpans, Span, Trace, TraceCombiner, DATA_ENCODING_PROTO,
    };
    use spanvault_ring::{Ring, RingConfig};

    fn trace_id(n: u8) -> Vec<u8> {
        let mut id = vec![0u8; 16];
        id[15] = n;
        id
    }

    fn trace_obj(tid: &[u8], span_n: u8) -> Vec<u8> {
        Trace {
            batches: vec![ResourceSpans {
                resource: None,
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans: vec![Span {
                        trace_id: tid.to_vec(),
                        span_id: vec![span_n; 8],
                        ..Default::default()
                    }],
                }],
            }],
        }
        .encode_to_vec()
    }

    fn block_cfg() -> BlockConfig {
        BlockConfig {
            target_page_size: 128,
            encoding: Encoding::None,
            bloom_shard_count: 2,
            bloom_false_positive: 0.01,
        }
    }

    async fn write_test_block(
        backend: Arc<MemoryBackend>,
        objects: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> BlockMeta {
        write_block_from_objects(
            backend,
            "t",
            Uuid::new_v4(),
            DATA_ENCODING_PROTO,
            block_cfg(),
            Arc::new(TraceCombiner),
            objects,
        )
        .await
        .unwrap()
    }

    fn test_compactor(backend: Arc<MemoryBackend>, grace: Duration) -> Arc<Compactor> {
        Compactor::new(
            CompactorConfig {
                deletion_grace: grace,
                block: block_cfg(),
                ..CompactorConfig::default()
            },
            "compactor-0",
            Ring::new(RingConfig::default()),
            backend.clone(),
            backend,
            Arc::new(TraceCombiner),
            Arc::new(Overrides::default()),
        )
    }

    #[tokio::test]
    async fn test_compaction_merges_and_dedups() {
        let backend = Arc::new(MemoryBackend::new());
        let a = write_test_block(
            backend.clone(),
            vec![
                (trace_id(1), trace_obj(&trace_id(1), 1)),
                (trace_id(3), trace_obj(&trace_id(3), 1)),
            ],
        )
        .await;
        let b = write_test_block(
            backend.clone(),
            vec![
                (trace_id(2), trace_obj(&trace_id(2), 2)),
                (trace_id(3), trace_obj(&trace_id(3), 2)),
            ],
        )
        .await;

        let compactor = test_compactor(backend.clone(), Duration::from_secs(3600));
        compactor.run_once().await.unwrap();

        // inputs tombstoned, one new output exists
        for input in [&a, &b] {
            assert!(
                read_tombstone(backend.as_ref(), "t", input.block_id)
                    .await
                    .unwrap()
                    .is_some(),
                "input must be tombstoned"
            );
        }

        let metas = {
            compactor.poll_blocklist().await.unwrap();
            compactor.blocklist_for("t")
        };
        let output: Vec<&BlockMeta> = metas
            .iter()
            .filter(|m| m.block_id != a.block_id && m.block_id != b.block_id)
            .collect();
        assert_eq!(output.len(), 1);
        let output = output[0];
        assert_eq!(output.total_objects, 3);

        // the overlapping trace carries both spans after the merge
        let combined = find_in_block(
            backend.clone(),
            output,
            &trace_id(3),
            Arc::new(TraceCombiner),
        )
        .await
        .unwrap()
        .unwrap();
        let trace = Trace::decode(combined.as_slice()).unwrap();
        assert_eq!(trace.span_count(), 2);
    }

    #[tokio::test]
    async fn test_compaction_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        write_test_block(
            backend.clone(),
            vec![(trace_id(1), trace_obj(&trace_id(1), 1))],
        )
        .await;
        write_test_block(
            backend.clone(),
            vec![(trace_id(1), trace_obj(&trace_id(1), 2))],
        )
        .await;

        let compactor = test_compactor(backend.clone(), Duration::ZERO);
        compactor.run_once().await.unwrap();
        // second cycle sweeps the tombstoned inputs and finds nothing new
        compactor.run_once().await.unwrap();
        let after_first = {
            compactor.poll_blocklist().await.unwrap();
            compactor.blocklist_for("t")
        };
        assert_eq!(after_first.len(), 1, "inputs deleted, one output remains");
        let output_id = after_first[0].block_id;
        assert_eq!(after_first[0].total_objects, 1);

        // compacting the already-compacted tenant changes nothing
        compactor.run_once().await.unwrap();
        compactor.poll_blocklist().await.unwrap();
        let after_second = compactor.blocklist_for("t");
        assert_eq!(after_second.len(), 1);
        assert_eq!(after_second[0].block_id, output_id);

        let combined = find_in_block(
            backend.clone(),
            &after_second[0],
            &trace_id(1),
            Arc::new(TraceCombiner),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(Trace::decode(combined.as_slice()).unwrap().span_count(), 2);
    }

    #[tokio::test]
    async fn test_single_block_is_left_alone() {
        let backend = Arc::new(MemoryBackend::new());
        let meta = write_test_block(
            backend.clone(),
            vec![(trace_id(1), trace_obj(&trace_id(1), 1))],
        )
        .await;

        let compactor = test_compactor(backend.clone(), Duration::from_secs(3600));
        compactor.run_once().await.unwrap();

        assert!(read_tombstone(backend.as_ref(), "t", meta.block_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ring_partitions_job_ownership() {
        use spanvault_ring::{InstanceDesc, InstanceState};
        use std::time::Instant;

        let backend = Arc::new(MemoryBackend::new());
        let ring = Ring::new(RingConfig {
            replication_factor: 1,
            heartbeat_timeout: Duration::from_secs(60),
        });
        for (id, token) in [("c-0", u32::MAX / 3), ("c-1", 2 * (u32::MAX / 3))] {
            ring.register(InstanceDesc {
                id: id.to_string(),
                addr: String::new(),
                state: InstanceState::Active,
                tokens: vec![token],
                last_heartbeat: Instant::now(),
            });
        }

        let make = |instance_id: &str| {
            Compactor::new(
                CompactorConfig::default(),
                instance_id,
                ring.clone(),
                backend.clone(),
                backend.clone(),
                Arc::new(TraceCombiner),
                Arc::new(Overrides::default()),
            )
        };
        let c0 = make("c-0");
        let c1 = make("c-1");

        let job = vec![
            write_test_block(backend.clone(), vec![(trace_id(1), trace_obj(&trace_id(1), 1))]).await,
            write_test_block(backend.clone(), vec![(trace_id(2), trace_obj(&trace_id(2), 1))]).await,
        ];

        // exactly one compactor owns any given job
        assert_ne!(c0.owns_job(&job), c1.owns_job(&job));
    }

    #[tokio::test]
    async fn test_retention_tombstones_then_deletes() {
        let backend = Arc::new(MemoryBackend::new());
        let mut meta = write_test_block(
            backend.clone(),
            vec![(trace_id(1), trace_obj(&trace_id(1), 1))],
        )
        .await;

        // age the block past retention by rewriting its meta
        meta.start_time = Utc::now() - chrono::Duration::days(30);
        meta.end_time = Utc::now() - chrono::Duration::days(30);
        spanvault_backend::write_block_meta(backend.as_ref(), &meta)
            .await
            .unwrap();

        let compactor = test_compactor(backend.clone(), Duration::ZERO);

        compactor.poll_blocklist().await.unwrap();
        compactor.sweep_tenant("t").await.unwrap();
        assert!(read_tombstone(backend.as_ref(), "t", meta.block_id)
            .await
            .unwrap()
            .is_some());

        // next sweep, past the zero grace, removes the artifacts
        compactor.poll_blocklist().await.unwrap();
        compactor.sweep_tenant("t").await.unwrap();
        assert!(
            read_block_meta(backend.as_ref(), "t", meta.block_id)
                .await
                .is_err()
        );
        assert_eq!(list_blocks(backend.as_ref(), "t").await.unwrap().len(), 0);
    }
}
