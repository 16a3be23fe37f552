// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant limits. A tenant without an explicit entry gets the defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error message prefixes carried across the ingester RPC boundary. The
/// distributor classifies failures by prefix so it does not need to share
/// typed errors with the ingester.
pub const ERROR_PREFIX_RATE_LIMITED: &str = "RATE_LIMITED";
pub const ERROR_PREFIX_TRACE_TOO_LARGE: &str = "TRACE_TOO_LARGE";
pub const ERROR_PREFIX_LIVE_TRACES_EXCEEDED: &str = "LIVE_TRACES_EXCEEDED";

/// How ingestion rate limits are enforced across distributors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestionRateStrategy {
    /// Every distributor enforces the full tenant limit independently.
    #[default]
    Local,
    /// The tenant limit is split across the healthy distributors.
    Global,
}

/// Limits applied to a single tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub ingestion_rate_strategy: IngestionRateStrategy,
    pub ingestion_rate_limit_bytes: usize,
    pub ingestion_burst_size_bytes: usize,
    pub max_bytes_per_trace: usize,
    pub max_local_traces_per_tenant: usize,
    pub max_global_traces_per_tenant: usize,
    #[serde(with = "humantime_serde")]
    pub block_retention: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            ingestion_rate_strategy: IngestionRateStrategy::Local,
            ingestion_rate_limit_bytes: 15_000_000,
            ingestion_burst_size_bytes: 20_000_000,
            max_bytes_per_trace: 5_000_000,
            max_local_traces_per_tenant: 10_000,
            max_global_traces_per_tenant: 0,
            block_retention: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// Tenant limit registry: global defaults plus per-tenant overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub defaults: Limits,
    pub per_tenant: HashMap<String, Limits>,
}

impl Overrides {
    pub fn new(defaults: Limits) -> Self {
        Overrides {
            defaults,
            per_tenant: HashMap::new(),
        }
    }

    pub fn limits(&self, tenant: &str) -> &Limits {
        self.per_tenant.get(tenant).unwrap_or(&self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_unknown_tenants() {
        let o = Overrides::default();
        assert_eq!(o.limits("nobody").max_bytes_per_trace, 5_000_000);
    }

    #[test]
    fn test_per_tenant_override_wins() {
        let mut o = Overrides::default();
        o.per_tenant.insert(
            "big".to_string(),
            Limits {
                max_bytes_per_trace: 50_000_000,
                ..Limits::default()
            },
        );
        assert_eq!(o.limits("big").max_bytes_per_trace, 50_000_000);
        assert_eq!(o.limits("small").max_bytes_per_trace, 5_000_000);
    }

    #[test]
    fn test_block_retention_accepts_humantime_strings() {
        let limits: Limits =
            serde_json::from_str(r#"{"block_retention": "2h"}"#).unwrap();
        assert_eq!(limits.block_retention, Duration::from_secs(7200));

        let limits: Limits =
            serde_json::from_str(r#"{"block_retention": "14d"}"#).unwrap();
        assert_eq!(limits.block_retention, Duration::from_secs(14 * 24 * 3600));

        // a bare number has no unit and is rejected
        assert!(serde_json::from_str::<Limits>(r#"{"block_retention": "90"}"#).is_err());
    }

    #[test]
    fn test_block_retention_round_trips() {
        let json = serde_json::to_string(&Limits::default()).unwrap();
        let back: Limits = serde_json::from_str(&json).unwrap();
        assert_eq!(back.block_retention, Limits::default().block_retention);
    }
}
