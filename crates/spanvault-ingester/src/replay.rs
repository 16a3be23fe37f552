// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Restart recovery.
//!
//! Three kinds of state can exist on local disk after a crash, and each is
//! brought back differently:
//! - the WAL of the head that was open: its fragments become live traces
//!   again (re-appended through the write path so the new head owns them);
//! - sealed WALs whose block build never finished: rebuilt into complete
//!   blocks directly;
//! - complete blocks that were built but possibly not uploaded: reopened
//!   and re-queued for flush. Re-uploading an already-uploaded block is an
//!   idempotent overwrite, so a crash between artifact upload and meta
//!   publication heals here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use spanvault_backend::{list_blocks, list_tenants, read_block_meta};
use spanvault_block::head::parse_wal_file_name;
use spanvault_block::{write_block_from_objects, CompleteBlock, Wal};
use spanvault_model::overrides::Limits;
use spanvault_model::DATA_ENCODING_PROTO;
use tracing::{info, warn};
use uuid::Uuid;

use crate::flush::FlushOp;
use crate::ingester::Ingester;
use crate::metrics::METRIC_WAL_REPLAYS;
use crate::IngestError;

/// Limits are not enforced during replay: everything in the WAL was already
/// admitted once.
fn replay_limits() -> Limits {
    Limits {
        max_bytes_per_trace: 0,
        max_local_traces_per_tenant: 0,
        ..Limits::default()
    }
}

pub async fn replay_all(ingester: &Arc<Ingester>) -> Result<(), IngestError> {
    let mut rebuilt_blocks: HashSet<Uuid> = HashSet::new();

    // pass one: wal files
    let entries = std::fs::read_dir(&ingester.cfg.wal_path)
        .map_err(spanvault_block::BlockError::Io)?;
    for entry in entries {
        let entry = entry.map_err(spanvault_block::BlockError::Io)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((block_id, tenant, sealed)) = parse_wal_file_name(&name) else {
            continue;
        };
        let path = entry.path();

        if sealed {
            METRIC_WAL_REPLAYS.with_label_values(&["sealed"]).inc();
            info!(tenant = %tenant, block = %block_id, "rebuilding block from sealed wal");

            let objects = group_fragments(ingester, Wal::replay(&path)?)?;
            let instance = ingester.get_or_create_instance(&tenant)?;
            let meta = write_block_from_objects(
                ingester.local.clone(),
                &tenant,
                block_id,
                DATA_ENCODING_PROTO,
                ingester.cfg.block.clone(),
                ingester.combiner.clone(),
                objects,
            )
            .await?;
            let block = CompleteBlock::open(ingester.local.clone(), meta).await?;
            instance.add_complete_block(Arc::new(block));
            rebuilt_blocks.insert(block_id);

            std::fs::remove_file(&path).map_err(spanvault_block::BlockError::Io)?;
        } else {
            METRIC_WAL_REPLAYS.with_label_values(&["head"]).inc();
            info!(tenant = %tenant, block = %block_id, "replaying head wal into live traces");

            let fragments = Wal::replay(&path)?;
            let instance = ingester.get_or_create_instance(&tenant)?;
            let limits = replay_limits();
            for (id, fragment) in fragments {
                // re-append through the write path so the fragment is
                // durable in the new head's wal before the old file goes
                instance.push_bytes(&id, &fragment, &limits)?;
            }
            std::fs::remove_file(&path).map_err(spanvault_block::BlockError::Io)?;
        }
    }

    // pass two: complete blocks already on local disk
    for tenant in list_tenants(ingester.local.as_ref()).await? {
        let instance = ingester.get_or_create_instance(&tenant)?;
        for block_id in list_blocks(ingester.local.as_ref(), &tenant).await? {
            if rebuilt_blocks.contains(&block_id) {
                continue;
            }
            let meta = match read_block_meta(ingester.local.as_ref(), &tenant, block_id).await {
                Ok(meta) => meta,
                // no meta: the block build itself died halfway; its sealed
                // wal (handled above) is the source of truth
                Err(e) if e.is_does_not_exist() => {
                    warn!(tenant = %tenant, block = %block_id, "removing partial local block");
                    let dir = ingester
                        .local
                        .root()
                        .join(&tenant)
                        .join(block_id.to_string());
                    let _ = std::fs::remove_dir_all(dir);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let block = CompleteBlock::open(ingester.local.clone(), meta).await?;
            instance.add_complete_block(Arc::new(block));
        }
    }

    // everything local is treated as not-yet-uploaded and re-queued
    let instances: Vec<_> = ingester.instances.read().values().cloned().collect();
    for instance in instances {
        for meta in instance.unflushed_blocks() {
            let op = FlushOp {
                tenant: meta.tenant_id.clone(),
                block_id: meta.block_id,
            };
            if ingester.flush_tx.send(op).await.is_err() {
                warn!("flush queue closed during replay");
            }
        }
    }

    Ok(())
}

/// Groups raw WAL fragments by trace id and combines each group into one
/// object, the same shape a cut live trace would have produced.
fn group_fragments(
    ingester: &Ingester,
    fragments: Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IngestError> {
    let mut by_id: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    for (id, fragment) in fragments {
        let combined = match by_id.remove(&id) {
            None => fragment,
            Some(acc) => ingester
                .combiner
                .combine(DATA_ENCODING_PROTO, &acc, &fragment)?,
        };
        by_id.insert(id, combined);
    }
    Ok(by_id.into_iter().collect())
}
