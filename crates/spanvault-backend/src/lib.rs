// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw byte I/O over object stores, plus the decorators that wrap it.
//!
//! Everything durable lives under `<tenant>/<blockID>/` as four artifacts:
//!
//! ```text
//! <tenant>/<blockID>/data
//! <tenant>/<blockID>/index
//! <tenant>/<blockID>/bloom-0 ... bloom-(N-1)
//! <tenant>/<blockID>/meta.json
//! ```
//!
//! Writing `meta.json` last is what declares a block complete and readable.

pub mod cache;
pub mod hedge;
pub mod local;
pub mod memory;
pub mod meta;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

pub use cache::{CachedBackend, KeyValueCache, MemoryCache};
pub use hedge::HedgedReader;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use meta::{BlockMeta, Encoding};

/// Backend object name of the page stream.
pub const NAME_OBJECTS: &str = "data";
/// Backend object name of the record index.
pub const NAME_INDEX: &str = "index";
/// Prefix of the per-shard bloom filter objects.
pub const NAME_BLOOM_PREFIX: &str = "bloom-";
/// Backend object name of the block manifest.
pub const NAME_META: &str = "meta.json";
/// Marker object written when a block is scheduled for deletion.
pub const NAME_TOMBSTONE: &str = "deleted.json";

/// Backend object name of bloom shard `shard`.
pub fn bloom_name(shard: usize) -> String {
    format!("{NAME_BLOOM_PREFIX}{shard}")
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The canonical not-found error. Every backend normalizes its own
    /// missing-object signal to this variant.
    #[error("object does not exist")]
    DoesNotExist,

    #[error("backend io: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad block meta: {0}")]
    BadMeta(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, BackendError::DoesNotExist)
    }
}

/// Ordered path segments an object lives under, e.g. `[tenant, blockID]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(pub Vec<String>);

impl KeyPath {
    pub fn from_block(tenant: &str, block_id: Uuid) -> Self {
        KeyPath(vec![tenant.to_string(), block_id.to_string()])
    }

    pub fn from_tenant(tenant: &str) -> Self {
        KeyPath(vec![tenant.to_string()])
    }

    pub fn root() -> Self {
        KeyPath(Vec::new())
    }

    /// Cache key for an object: `join(keypath, ":") + ":" + name`.
    pub fn cache_key(&self, name: &str) -> String {
        let mut key = self.0.join(":");
        key.push(':');
        key.push_str(name);
        key
    }
}

/// Opaque handle for an in-progress streaming append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppendTracker(pub(crate) u64);

/// Read side of a backend.
#[async_trait]
pub trait RawReader: Send + Sync {
    /// Lists the immediate children of a keypath.
    async fn list(&self, keypath: &KeyPath) -> Result<Vec<String>, BackendError>;

    /// Reads a whole object.
    async fn read(
        &self,
        name: &str,
        keypath: &KeyPath,
        should_cache: bool,
    ) -> Result<Bytes, BackendError>;

    /// Reads exactly `buffer.len()` bytes starting at `offset`.
    async fn read_range(
        &self,
        name: &str,
        keypath: &KeyPath,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), BackendError>;
}

/// Write side of a backend.
#[async_trait]
pub trait RawWriter: Send + Sync {
    /// Atomic create-or-replace. Durable on return.
    async fn write(
        &self,
        name: &str,
        keypath: &KeyPath,
        data: Bytes,
        should_cache: bool,
    ) -> Result<(), BackendError>;

    /// Streaming append. Pass `None` to start a new object; pass the returned
    /// tracker to continue it. Object stores without native append may buffer
    /// until [`RawWriter::close_append`].
    async fn append(
        &self,
        name: &str,
        keypath: &KeyPath,
        tracker: Option<AppendTracker>,
        buffer: &[u8],
    ) -> Result<AppendTracker, BackendError>;

    /// Completes a streaming append, making the object durable.
    async fn close_append(&self, tracker: AppendTracker) -> Result<(), BackendError>;

    /// Removes a single object. Missing objects are not an error.
    async fn delete(&self, name: &str, keypath: &KeyPath) -> Result<(), BackendError>;
}

/// Writes a block manifest. Its presence declares the block readable, so this
/// must be the final write of a block.
pub async fn write_block_meta(
    writer: &dyn RawWriter,
    meta: &BlockMeta,
) -> Result<(), BackendError> {
    let keypath = KeyPath::from_block(&meta.tenant_id, meta.block_id);
    let bytes = serde_json::to_vec(meta)?;
    writer.write(NAME_META, &keypath, Bytes::from(bytes), false).await
}

pub async fn read_block_meta(
    reader: &dyn RawReader,
    tenant: &str,
    block_id: Uuid,
) -> Result<BlockMeta, BackendError> {
    let keypath = KeyPath::from_block(tenant, block_id);
    let bytes = reader.read(NAME_META, &keypath, false).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Lists the block ids present for a tenant. Children that do not parse as
/// UUIDs are skipped.
pub async fn list_blocks(
    reader: &dyn RawReader,
    tenant: &str,
) -> Result<Vec<Uuid>, BackendError> {
    let children = match reader.list(&KeyPath::from_tenant(tenant)).await {
        Ok(c) => c,
        Err(BackendError::DoesNotExist) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(children
        .iter()
        .filter_map(|c| Uuid::parse_str(c).ok())
        .collect())
}

/// Lists all tenants with at least one block.
pub async fn list_tenants(reader: &dyn RawReader) -> Result<Vec<String>, BackendError> {
    match reader.list(&KeyPath::root()).await {
        Ok(c) => Ok(c),
        Err(BackendError::DoesNotExist) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// A reader/writer pair, as wired by the storage config.
pub type BackendPair = (Arc<dyn RawReader>, Arc<dyn RawWriter>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let kp = KeyPath::from_block("tenant-a", Uuid::nil());
        assert_eq!(
            kp.cache_key("bloom-0"),
            "tenant-a:00000000-0000-0000-0000-000000000000:bloom-0"
        );
    }

    #[test]
    fn test_bloom_name() {
        assert_eq!(bloom_name(0), "bloom-0");
        assert_eq!(bloom_name(9), "bloom-9");
    }
}
