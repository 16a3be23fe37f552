// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Compression applied to block data pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    None,
    #[default]
    Zstd,
}

/// The per-block manifest, stored as `meta.json`. Field names are stable: the
/// manifest is read back by every component and by other versions of the
/// service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    #[serde(rename = "blockID")]
    pub block_id: Uuid,
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    pub version: String,
    pub encoding: Encoding,
    #[serde(rename = "dataEncoding")]
    pub data_encoding: String,
    #[serde(rename = "totalObjects")]
    pub total_objects: u64,
    /// Total bytes of the data object.
    pub size: u64,
    #[serde(rename = "minID", with = "hex_bytes")]
    pub min_id: Vec<u8>,
    #[serde(rename = "maxID", with = "hex_bytes")]
    pub max_id: Vec<u8>,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "bloomShardCount")]
    pub bloom_shard_count: u32,
    #[serde(rename = "bloomFalsePositive")]
    pub bloom_false_positive: f64,
}

/// The block format version this code writes.
pub const CURRENT_BLOCK_VERSION: &str = "v1";

impl BlockMeta {
    pub fn new(
        tenant_id: &str,
        block_id: Uuid,
        encoding: Encoding,
        data_encoding: &str,
        bloom_shard_count: u32,
        bloom_false_positive: f64,
    ) -> Self {
        let now = Utc::now();
        BlockMeta {
            block_id,
            tenant_id: tenant_id.to_string(),
            version: CURRENT_BLOCK_VERSION.to_string(),
            encoding,
            data_encoding: data_encoding.to_string(),
            total_objects: 0,
            size: 0,
            min_id: Vec::new(),
            max_id: Vec::new(),
            start_time: now,
            end_time: now,
            bloom_shard_count,
            bloom_false_positive,
        }
    }

    /// Records one appended object. Objects arrive in ascending id order, so
    /// the first id is the min and the latest id is the max.
    pub fn object_added(&mut self, id: &[u8]) {
        if self.min_id.is_empty() {
            self.min_id = id.to_vec();
        }
        self.max_id = id.to_vec();
        self.total_objects += 1;
        self.end_time = Utc::now();
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
