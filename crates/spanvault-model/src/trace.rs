// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire types for spans and traces.
//!
//! These are hand-derived prost messages rather than generated from a .proto
//! so the workspace builds without protoc. The shapes mirror the OTLP trace
//! grouping (resource -> scope -> span) because they compress well and
//! preserve the identity of the emitting process.

/// A single key/value attribute attached to a span or resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// The entity that produced a batch of spans (service name, host, ...).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(message, repeated, tag = "1")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// Identity of the instrumentation library that emitted the spans.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstrumentationScope {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
}

/// One unit of work within a trace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    #[prost(bytes = "vec", tag = "1")]
    pub trace_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub span_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub parent_span_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub start_time_unix_nano: u64,
    #[prost(uint64, tag = "6")]
    pub end_time_unix_nano: u64,
    #[prost(int32, tag = "7")]
    pub status_code: i32,
    #[prost(message, repeated, tag = "8")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// Spans grouped under the instrumentation scope that produced them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScopeSpans {
    #[prost(message, optional, tag = "1")]
    pub scope: ::core::option::Option<InstrumentationScope>,
    #[prost(message, repeated, tag = "2")]
    pub spans: ::prost::alloc::vec::Vec<Span>,
}

/// One batch of spans sharing a resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceSpans {
    #[prost(message, optional, tag = "1")]
    pub resource: ::core::option::Option<Resource>,
    #[prost(message, repeated, tag = "2")]
    pub scope_spans: ::prost::alloc::vec::Vec<ScopeSpans>,
}

/// All spans known for a single trace id, as an ordered list of batches.
///
/// A trace is not normalized. Duplicate or overlapping spans may appear when
/// emitters retry; deduplication is the reader's job via an
/// [`ObjectCombiner`](crate::ObjectCombiner).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trace {
    #[prost(message, repeated, tag = "1")]
    pub batches: ::prost::alloc::vec::Vec<ResourceSpans>,
}

/// The distributor -> ingester write request. The three arrays are aligned by
/// index: `traces[i]` is the marshaled [`Trace`] for `ids[i]`, and
/// `search_data[i]` is an optional opaque byte stream carried through
/// untouched.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushBytesRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub traces: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub search_data: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

impl Trace {
    /// Total number of spans across all batches.
    pub fn span_count(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| b.scope_spans.iter())
            .map(|ss| ss.spans.len())
            .sum()
    }
}
