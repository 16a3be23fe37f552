// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec,
};

pub const REASON_RATE_LIMITED: &str = "rate_limited";
pub const REASON_TRACE_TOO_LARGE: &str = "trace_too_large";
pub const REASON_LIVE_TRACES_EXCEEDED: &str = "live_traces_exceeded";
pub const REASON_INTERNAL_ERROR: &str = "internal_error";

lazy_static! {
    pub static ref METRIC_SPANS_INGESTED: IntCounterVec = register_int_counter_vec!(
        "spanvault_distributor_spans_received_total",
        "The total number of spans received per tenant",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_BYTES_INGESTED: IntCounterVec = register_int_counter_vec!(
        "spanvault_distributor_bytes_received_total",
        "The total number of proto bytes received per tenant",
        &["tenant"]
    )
    .unwrap();
    pub static ref METRIC_DISCARDED_SPANS: IntCounterVec = register_int_counter_vec!(
        "spanvault_discarded_spans_total",
        "The total number of spans that were discarded",
        &["reason", "tenant"]
    )
    .unwrap();
    pub static ref METRIC_INGESTER_APPENDS: IntCounterVec = register_int_counter_vec!(
        "spanvault_distributor_ingester_appends_total",
        "The total number of batch appends sent to ingesters",
        &["ingester"]
    )
    .unwrap();
    pub static ref METRIC_INGESTER_APPEND_FAILURES: IntCounterVec = register_int_counter_vec!(
        "spanvault_distributor_ingester_append_failures_total",
        "The total number of failed batch appends sent to ingesters",
        &["ingester"]
    )
    .unwrap();
    pub static ref METRIC_TRACES_PER_BATCH: Histogram = register_histogram!(
        "spanvault_distributor_traces_per_batch",
        "The number of traces in each batch",
        prometheus::exponential_buckets(2.0, 2.0, 10).unwrap()
    )
    .unwrap();
}
