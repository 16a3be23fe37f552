// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

lazy_static! {
    pub static ref METRIC_LIVE_TRACES: IntGaugeVec = register_int_gauge_vec!(
        "spanvault_ingester_live_traces",
        "The current number of live traces per tenant",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_TRACES_CREATED: IntCounterVec = register_int_counter_vec!(
        "spanvault_ingester_traces_created_total",
        "The total number of traces created per tenant",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_BLOCKS_CLEARED: IntCounterVec = register_int_counter_vec!(
        "spanvault_ingester_blocks_cleared_total",
        "The total number of local blocks removed after flush",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_BLOCKS_FLUSHED: IntCounterVec = register_int_counter_vec!(
        "spanvault_ingester_blocks_flushed_total",
        "The total number of blocks uploaded to the backend",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_FLUSH_RETRIES: IntCounterVec = register_int_counter_vec!(
        "spanvault_ingester_flush_retries_total",
        "The total number of failed flush attempts that will be retried",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_WAL_REPLAYS: IntCounterVec = register_int_counter_vec!(
        "spanvault_ingester_wal_replays_total",
        "The total number of wal files replayed at startup",
        &["kind"]
    )
    .unwrap();
}
