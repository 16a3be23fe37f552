// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::ModelError;

/// Trace ids are always 16 raw bytes. Anything else is rejected at the edge.
pub const TRACE_ID_LEN: usize = 16;

/// Validates a trace id, rejecting any length other than 16 bytes.
pub fn validate_trace_id(id: &[u8]) -> Result<(), ModelError> {
    if id.len() != TRACE_ID_LEN {
        return Err(ModelError::InvalidTraceId);
    }
    Ok(())
}

/// Hex rendering of a trace id for logs and URLs.
pub fn trace_id_to_hex(id: &[u8]) -> String {
    hex::encode(id)
}

/// Parses a hex trace id, enforcing the 16 byte invariant.
pub fn trace_id_from_hex(s: &str) -> Result<Vec<u8>, ModelError> {
    let id = hex::decode(s).map_err(|_| ModelError::InvalidTraceId)?;
    validate_trace_id(&id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_trace_id() {
        assert!(validate_trace_id(&[0u8; 16]).is_ok());
        assert!(validate_trace_id(&[0u8; 8]).is_err());
        assert!(validate_trace_id(&[0u8; 17]).is_err());
        assert!(validate_trace_id(&[]).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let id: Vec<u8> = (1..=16).collect();
        let s = trace_id_to_hex(&id);
        assert_eq!(s, "0102030405060708090a0b0c0d0e0f10");
        assert_eq!(trace_id_from_hex(&s).unwrap(), id);
        assert!(trace_id_from_hex("0102").is_err());
        assert!(trace_id_from_hex("zz").is_err());
    }
}
