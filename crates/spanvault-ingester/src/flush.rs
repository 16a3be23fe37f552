// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Block upload: a bounded work queue drained by a fixed set of workers.
//! A failed upload is retried in place with exponential backoff, so the
//! failing block stays at the front of its worker's queue.

use std::sync::Arc;
use std::time::Duration;

use spanvault_backend::{
    bloom_name, read_block_meta, write_block_meta, BackendError, BlockMeta, KeyPath, RawReader,
    RawWriter, NAME_INDEX, NAME_OBJECTS,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ingester::Ingester;
use crate::metrics::{METRIC_BLOCKS_FLUSHED, METRIC_FLUSH_RETRIES};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FlushOp {
    pub tenant: String,
    pub block_id: Uuid,
}

/// Copies a complete block between backends, meta last so the destination
/// never exposes a partial block.
pub async fn copy_block(
    src: &dyn RawReader,
    dst: &dyn RawWriter,
    meta: &BlockMeta,
) -> Result<(), BackendError> {
    let keypath = KeyPath::from_block(&meta.tenant_id, meta.block_id);

    let data = src.read(NAME_OBJECTS, &keypath, false).await?;
    dst.write(NAME_OBJECTS, &keypath, data, false).await?;

    for shard in 0..meta.bloom_shard_count as usize {
        let name = bloom_name(shard);
        let bloom = src.read(&name, &keypath, true).await?;
        dst.write(&name, &keypath, bloom, true).await?;
    }

    let index = src.read(NAME_INDEX, &keypath, false).await?;
    dst.write(NAME_INDEX, &keypath, index, false).await?;

    write_block_meta(dst, meta).await
}

pub fn spawn_flush_workers(
    ingester: Arc<Ingester>,
    rx: mpsc::Receiver<FlushOp>,
    workers: usize,
) {
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..workers.max(1) {
        let ingester = ingester.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let op = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        op = rx.recv() => op,
                        _ = ingester.cancel.cancelled() => return,
                    }
                };
                let Some(op) = op else { return };
                flush_with_retry(&ingester, op).await;
            }
        });
    }
}

async fn flush_with_retry(ingester: &Ingester, op: FlushOp) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match flush_one(ingester, &op).await {
            Ok(()) => {
                METRIC_BLOCKS_FLUSHED
                    .with_label_values(&[op.tenant.as_str()])
                    .inc();
                info!(tenant = %op.tenant, block = %op.block_id, "block flushed");
                return;
            }
            Err(e) => {
                METRIC_FLUSH_RETRIES
                    .with_label_values(&[op.tenant.as_str()])
                    .inc();
                warn!(
                    tenant = %op.tenant,
                    block = %op.block_id,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "block flush failed, will retry"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = ingester.cancel.cancelled() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn flush_one(ingester: &Ingester, op: &FlushOp) -> Result<(), BackendError> {
    let meta = read_block_meta(ingester.local.as_ref(), &op.tenant, op.block_id).await?;
    copy_block(
        ingester.local.as_ref(),
        ingester.store_writer.as_ref(),
        &meta,
    )
    .await?;

    if let Some(instance) = ingester.instances.read().get(&op.tenant).cloned() {
        instance.mark_flushed(op.block_id);
    }
    Ok(())
}
