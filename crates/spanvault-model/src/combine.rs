// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merging of serialized trace fragments.
//!
//! The combiner is a capability passed into readers and iterators, never a
//! global registry. It must be associative and commutative with respect to
//! the resulting span set: fragments arrive from replicas and blocks in no
//! particular order.

use std::collections::HashSet;

use prost::Message;

use crate::trace::Trace;
use crate::{ModelError, DATA_ENCODING_PROTO};

/// Combines two serialized objects that share an id into one.
///
/// Either input may be empty, in which case the other is returned unchanged.
pub trait ObjectCombiner: Send + Sync {
    fn combine(
        &self,
        data_encoding: &str,
        a: &[u8],
        b: &[u8],
    ) -> Result<Vec<u8>, ModelError>;
}

/// The default combiner for trace payloads: concatenates batches and drops
/// spans whose span id was already seen. Emitter retries therefore collapse
/// to a single span, while distinct spans are all preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceCombiner;

impl ObjectCombiner for TraceCombiner {
    fn combine(&self, data_encoding: &str, a: &[u8], b: &[u8]) -> Result<Vec<u8>, ModelError> {
        if data_encoding != DATA_ENCODING_PROTO {
            return Err(ModelError::UnknownDataEncoding(data_encoding.to_string()));
        }
        if a.is_empty() {
            return Ok(b.to_vec());
        }
        if b.is_empty() {
            return Ok(a.to_vec());
        }

        let mut merged = Trace::decode(a)?;
        let other = Trace::decode(b)?;
        merged.batches.extend(other.batches);

        dedup_spans(&mut merged);
        Ok(merged.encode_to_vec())
    }
}

fn dedup_spans(trace: &mut Trace) {
    let mut seen: HashSet<Vec<u8>> = HashSet::new();

    for batch in &mut trace.batches {
        for ss in &mut batch.scope_spans {
            ss.spans.retain(|s| seen.insert(s.span_id.clone()));
        }
        batch.scope_spans.retain(|ss| !ss.spans.is_empty());
    }
    trace.batches.retain(|b| !b.scope_spans.is_empty());
}
