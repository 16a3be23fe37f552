// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The compactor: merges small blocks into larger ones, dedups overlapping
//! traces through the combiner, and enforces retention with a deletion
//! grace window.

pub mod compactor;
pub mod sweep;

pub use compactor::{Compactor, CompactorConfig};
pub use sweep::Tombstone;

use spanvault_backend::BackendError;
use spanvault_block::BlockError;
use spanvault_model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("compaction inputs disagree on data encoding: {0} vs {1}")]
    MixedDataEncoding(String, String),
}

pub(crate) mod metrics {
    use lazy_static::lazy_static;
    use prometheus::{register_int_counter_vec, IntCounterVec};

    lazy_static! {
        pub static ref METRIC_BLOCKS_COMPACTED: IntCounterVec = register_int_counter_vec!(
            "spanvault_compactor_blocks_compacted_total",
            "The total number of input blocks consumed by compaction",
            &["tenant"]
        )
        .unwrap();
        pub static ref METRIC_BLOCKS_RETIRED: IntCounterVec = register_int_counter_vec!(
            "spanvault_compactor_blocks_retired_total",
            "The total number of blocks deleted after their grace window",
            &["tenant"]
        )
        .unwrap();
    }
}
