// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingester service: tenant instances, the cut/rotate/flush loop and
//! point lookup across live traces, local blocks and the backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prost::Message;
use spanvault_backend::{
    list_blocks, read_block_meta, LocalBackend, RawReader, RawWriter,
};
use spanvault_block::{find_in_block, BlockConfig};
use spanvault_model::overrides::Overrides;
use spanvault_model::{validate_trace_id, ObjectCombiner, PushBytesRequest, Trace, DATA_ENCODING_PROTO};
use spanvault_ring::Lifecycler;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::flush::{self, FlushOp};
use crate::instance::TenantInstance;
use crate::metrics::METRIC_BLOCKS_CLEARED;
use crate::replay;
use crate::IngestError;

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub max_block_duration: Duration,
    pub max_block_bytes: u64,
    pub trace_idle_period: Duration,
    pub max_trace_idle: Duration,
    pub flush_check_period: Duration,
    pub complete_block_timeout: Duration,
    pub concurrent_flushes: usize,
    pub flush_queue_depth: usize,
    pub wal_path: PathBuf,
    pub blocks_path: PathBuf,
    pub block: BlockConfig,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        IngesterConfig {
            max_block_duration: Duration::from_secs(3600),
            max_block_bytes: 1024 * 1024 * 1024,
            trace_idle_period: Duration::from_secs(10),
            max_trace_idle: Duration::from_secs(1800),
            flush_check_period: Duration::from_secs(10),
            complete_block_timeout: Duration::from_secs(15 * 60),
            concurrent_flushes: 4,
            flush_queue_depth: 100,
            wal_path: PathBuf::from("/var/spanvault/wal"),
            blocks_path: PathBuf::from("/var/spanvault/blocks"),
            block: BlockConfig::default(),
        }
    }
}

/// Mirrors the ring lifecycle. LEAVING still serves reads but refuses
/// writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngesterState {
    Starting,
    Active,
    Leaving,
    Stopped,
}

pub struct Ingester {
    pub(crate) cfg: IngesterConfig,
    pub(crate) overrides: Arc<Overrides>,
    pub(crate) combiner: Arc<dyn ObjectCombiner>,
    pub(crate) local: Arc<LocalBackend>,
    pub(crate) store_reader: Arc<dyn RawReader>,
    pub(crate) store_writer: Arc<dyn RawWriter>,
    pub(crate) lifecycler: Lifecycler,
    pub(crate) instances: RwLock<HashMap<String, Arc<TenantInstance>>>,
    pub(crate) state: RwLock<IngesterState>,
    pub(crate) flush_tx: mpsc::Sender<FlushOp>,
    flush_rx: parking_lot::Mutex<Option<mpsc::Receiver<FlushOp>>>,
    pub(crate) cancel: CancellationToken,
}

impl Ingester {
    pub fn new(
        cfg: IngesterConfig,
        overrides: Arc<Overrides>,
        combiner: Arc<dyn ObjectCombiner>,
        store_reader: Arc<dyn RawReader>,
        store_writer: Arc<dyn RawWriter>,
        lifecycler: Lifecycler,
    ) -> Result<Arc<Self>, IngestError> {
        std::fs::create_dir_all(&cfg.wal_path)
            .map_err(spanvault_block::BlockError::Io)?;
        let local = Arc::new(LocalBackend::new(&cfg.blocks_path)?);
        let (flush_tx, flush_rx) = mpsc::channel(cfg.flush_queue_depth);

        Ok(Arc::new(Ingester {
            cfg,
            overrides,
            combiner,
            local,
            store_reader,
            store_writer,
            lifecycler,
            instances: RwLock::new(HashMap::new()),
            state: RwLock::new(IngesterState::Starting),
            flush_tx,
            flush_rx: parking_lot::Mutex::new(Some(flush_rx)),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn state(&self) -> IngesterState {
        *self.state.read()
    }

    /// Replays local WALs and blocks, joins the ring, and starts the flush
    /// workers and the cut loop. The instance only turns ACTIVE once replay
    /// has completed.
    pub async fn start(self: &Arc<Self>) -> Result<(), IngestError> {
        self.lifecycler.join().map_err(ring_to_ingest)?;

        // workers first: replay may enqueue more blocks than the queue holds
        let rx = self
            .flush_rx
            .lock()
            .take()
            .expect("ingester started twice");
        flush::spawn_flush_workers(self.clone(), rx, self.cfg.concurrent_flushes);

        replay::replay_all(self).await?;

        self.lifecycler.activate().map_err(ring_to_ingest)?;
        *self.state.write() = IngesterState::Active;
        info!("ingester active");

        let ingester = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ingester.cfg.flush_check_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => ingester.sweep_instances().await,
                    _ = ingester.cancel.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    /// One pass of the cut decisions: evict idle traces, rotate oversized or
    /// overaged heads, and drop local blocks past the handoff window.
    pub async fn sweep_instances(&self) {
        let instances: Vec<Arc<TenantInstance>> =
            self.instances.read().values().cloned().collect();

        for instance in instances {
            if let Err(e) = instance.cut_idle_traces(
                self.cfg.trace_idle_period,
                self.cfg.max_trace_idle,
            ) {
                error!(tenant = instance.tenant(), error = %e, "cutting idle traces failed");
            }

            if instance.should_rotate(self.cfg.max_block_bytes, self.cfg.max_block_duration) {
                if let Err(e) = self.rotate_and_enqueue(&instance).await {
                    error!(tenant = instance.tenant(), error = %e, "head rotation failed");
                }
            }

            match instance.clear_flushed_blocks(self.cfg.complete_block_timeout) {
                Ok(removed) if !removed.is_empty() => {
                    METRIC_BLOCKS_CLEARED
                        .with_label_values(&[instance.tenant()])
                        .inc_by(removed.len() as u64);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(tenant = instance.tenant(), error = %e, "clearing flushed blocks failed")
                }
            }
        }
    }

    /// Seals the head into a complete block and queues it for upload. When
    /// the flush queue is full this blocks, which pressures rotation and
    /// eventually surfaces as write latency rather than data loss.
    pub(crate) async fn rotate_and_enqueue(
        &self,
        instance: &Arc<TenantInstance>,
    ) -> Result<(), IngestError> {
        instance.cut_all_traces()?;
        let sealed = instance.rotate()?;
        let meta = instance.complete_sealed(sealed).await?;
        debug!(
            tenant = instance.tenant(),
            block = %meta.block_id,
            objects = meta.total_objects,
            "complete block cut"
        );

        let op = FlushOp {
            tenant: instance.tenant().to_string(),
            block_id: meta.block_id,
        };
        if self.flush_tx.send(op).await.is_err() {
            warn!("flush queue closed, block will be re-uploaded on restart");
        }
        Ok(())
    }

    /// Write path entry point. Arrays are aligned by index; the first
    /// failing item aborts the request and its error string carries the
    /// machine-readable prefix.
    pub fn push_bytes(&self, tenant: &str, req: &PushBytesRequest) -> Result<(), IngestError> {
        if self.state() != IngesterState::Active {
            return Err(IngestError::NotAcceptingWrites);
        }
        if req.traces.len() != req.ids.len() {
            return Err(IngestError::MisalignedRequest {
                traces: req.traces.len(),
                ids: req.ids.len(),
            });
        }

        let limits = self.effective_limits(tenant);
        let instance = self.get_or_create_instance(tenant)?;

        for (trace_bytes, trace_id) in req.traces.iter().zip(req.ids.iter()) {
            validate_trace_id(trace_id)?;
            instance.push_bytes(trace_id, trace_bytes, &limits)?;
        }
        Ok(())
    }

    /// Point lookup across everything this ingester can reach: the live
    /// trace map, the head block, local complete blocks and the tenant's
    /// backend blocks. Per-block read errors are logged and skipped; partial
    /// results beat empty ones.
    pub async fn find_trace_by_id(
        &self,
        tenant: &str,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, IngestError> {
        if self.state() == IngesterState::Stopped {
            return Ok(None);
        }
        validate_trace_id(trace_id)?;

        let mut fragments: Vec<Vec<u8>> = Vec::new();

        let instance = self.instances.read().get(tenant).cloned();
        if let Some(instance) = instance {
            let (local_fragments, blocks) = instance.gather_local(trace_id);
            fragments.extend(local_fragments);

            for block in blocks {
                match block.find(trace_id, self.combiner.clone()).await {
                    Ok(Some(obj)) => fragments.push(obj),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(block = %block.meta().block_id, error = %e, "local block read failed")
                    }
                }
            }
        }

        for block_id in list_blocks(self.store_reader.as_ref(), tenant).await? {
            let meta = match read_block_meta(self.store_reader.as_ref(), tenant, block_id).await {
                Ok(meta) => meta,
                // meta not yet written or already swept; not our block to read
                Err(e) if e.is_does_not_exist() => continue,
                Err(e) => {
                    warn!(block = %block_id, error = %e, "backend block meta read failed");
                    continue;
                }
            };

            if !meta.min_id.is_empty()
                && (trace_id < meta.min_id.as_slice() || trace_id > meta.max_id.as_slice())
            {
                continue;
            }

            match find_in_block(
                self.store_reader.clone(),
                &meta,
                trace_id,
                self.combiner.clone(),
            )
            .await
            {
                Ok(Some(obj)) => fragments.push(obj),
                Ok(None) => {}
                Err(e) => warn!(block = %block_id, error = %e, "backend block read failed"),
            }
        }

        if fragments.is_empty() {
            return Ok(None);
        }

        let mut combined: Vec<u8> = Vec::new();
        for fragment in &fragments {
            combined = self
                .combiner
                .combine(DATA_ENCODING_PROTO, &combined, fragment)?;
        }
        Ok(Some(Trace::decode(combined.as_slice()).map_err(
            spanvault_model::ModelError::Decode,
        )?))
    }

    /// Graceful exit: stop taking writes, push everything out, leave the
    /// ring.
    pub async fn shutdown(&self) -> Result<(), IngestError> {
        *self.state.write() = IngesterState::Leaving;
        self.lifecycler.begin_leaving().map_err(ring_to_ingest)?;
        info!("ingester leaving, running final flush");

        let instances: Vec<Arc<TenantInstance>> =
            self.instances.read().values().cloned().collect();
        for instance in instances {
            if instance.has_pending_data() {
                instance.cut_all_traces()?;
                let sealed = instance.rotate()?;
                instance.complete_sealed(sealed).await?;
            }
            for meta in instance.unflushed_blocks() {
                flush::copy_block(self.local.as_ref(), self.store_writer.as_ref(), &meta).await?;
                instance.mark_flushed(meta.block_id);
            }
        }

        self.cancel.cancel();
        self.lifecycler.shutdown();
        *self.state.write() = IngesterState::Stopped;
        Ok(())
    }

    /// Applies the global live-trace cap: when set, a tenant's global limit
    /// is split across the ingesters currently taking writes, and the
    /// stricter of local and global-share wins.
    fn effective_limits(&self, tenant: &str) -> spanvault_model::overrides::Limits {
        let mut limits = self.overrides.limits(tenant).clone();
        if limits.max_global_traces_per_tenant > 0 {
            let writers = self
                .lifecycler
                .ring()
                .healthy_instances(spanvault_ring::Op::Write)
                .len()
                .max(1);
            let share = (limits.max_global_traces_per_tenant / writers).max(1);
            limits.max_local_traces_per_tenant = if limits.max_local_traces_per_tenant == 0 {
                share
            } else {
                limits.max_local_traces_per_tenant.min(share)
            };
        }
        limits
    }

    pub(crate) fn get_or_create_instance(
        &self,
        tenant: &str,
    ) -> Result<Arc<TenantInstance>, IngestError> {
        if let Some(instance) = self.instances.read().get(tenant) {
            return Ok(instance.clone());
        }

        let mut instances = self.instances.write();
        if let Some(instance) = instances.get(tenant) {
            return Ok(instance.clone());
        }
        let instance = Arc::new(TenantInstance::new(
            tenant,
            self.cfg.wal_path.clone(),
            self.local.clone(),
            self.combiner.clone(),
            self.cfg.block.clone(),
        )?);
        instances.insert(tenant.to_string(), instance.clone());
        Ok(instance)
    }
}

fn ring_to_ingest(e: spanvault_ring::RingError) -> IngestError {
    IngestError::Backend(spanvault_backend::BackendError::Other(e.to_string()))
}
