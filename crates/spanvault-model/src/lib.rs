// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared data model for the trace store: the span/trace wire types, trace id
//! validation, the ring token function, the object combiner and per-tenant
//! limits.

pub mod combine;
pub mod id;
pub mod overrides;
pub mod token;
pub mod trace;

pub use combine::{ObjectCombiner, TraceCombiner};
pub use id::{validate_trace_id, TRACE_ID_LEN};
pub use token::{extend_token, token_for, token_for_bytes};
pub use trace::{
    InstrumentationScope, KeyValue, PushBytesRequest, Resource, ResourceSpans, ScopeSpans, Span,
    Trace,
};

/// Name of the inner object serialization carried in block metas. Readers use
/// it to pick the right combiner behavior for block payloads.
pub const DATA_ENCODING_PROTO: &str = "proto";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("trace ids must be 128 bit")]
    InvalidTraceId,

    #[error("failed to decode object: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("unknown data encoding {0}")]
    UnknownDataEncoding(String),
}
