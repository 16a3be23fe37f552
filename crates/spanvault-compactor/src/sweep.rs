// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tombstones and the deletion sweeper.
//!
//! Compaction never deletes its inputs outright: queriers may hold a
//! blocklist snapshot that still names them. A tombstone marks the block,
//! and the sweeper removes the artifacts once the grace window has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spanvault_backend::{
    bloom_name, read_block_meta, BackendError, KeyPath, RawReader, RawWriter, NAME_INDEX,
    NAME_META, NAME_OBJECTS, NAME_TOMBSTONE,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    #[serde(rename = "deletedTime")]
    pub deleted_time: DateTime<Utc>,
}

/// Marks a block for deletion. Idempotent.
pub async fn write_tombstone(
    writer: &dyn RawWriter,
    tenant: &str,
    block_id: Uuid,
) -> Result<(), BackendError> {
    let tombstone = Tombstone {
        deleted_time: Utc::now(),
    };
    let bytes = serde_json::to_vec(&tombstone)?;
    writer
        .write(
            NAME_TOMBSTONE,
            &KeyPath::from_block(tenant, block_id),
            bytes.into(),
            false,
        )
        .await
}

/// Reads a block's tombstone, if any.
pub async fn read_tombstone(
    reader: &dyn RawReader,
    tenant: &str,
    block_id: Uuid,
) -> Result<Option<Tombstone>, BackendError> {
    let keypath = KeyPath::from_block(tenant, block_id);
    match reader.read(NAME_TOMBSTONE, &keypath, false).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(BackendError::DoesNotExist) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes every artifact of a tombstoned block, meta first so no reader
/// can begin a lookup against a half-deleted block.
pub async fn delete_block(
    reader: &dyn RawReader,
    writer: &dyn RawWriter,
    tenant: &str,
    block_id: Uuid,
) -> Result<(), BackendError> {
    let keypath = KeyPath::from_block(tenant, block_id);

    let shard_count = match read_block_meta(reader, tenant, block_id).await {
        Ok(meta) => meta.bloom_shard_count as usize,
        Err(BackendError::DoesNotExist) => 0,
        Err(e) => return Err(e),
    };

    writer.delete(NAME_META, &keypath).await?;
    writer.delete(NAME_INDEX, &keypath).await?;
    writer.delete(NAME_OBJECTS, &keypath).await?;
    for shard in 0..shard_count {
        writer.delete(&bloom_name(shard), &keypath).await?;
    }
    writer.delete(NAME_TOMBSTONE, &keypath).await?;
    Ok(())
}
