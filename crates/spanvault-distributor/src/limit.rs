// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant token-bucket rate limiting.
//!
//! The strategy decides what one distributor's share of the tenant limit is.
//! Local: the full limit, enforced independently on each instance. Global:
//! the limit divided by the number of healthy distributors, recomputed on
//! every check so ring changes take effect immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use spanvault_model::overrides::Overrides;
use spanvault_ring::{Op, Ring};

pub trait RateLimiterStrategy: Send + Sync {
    /// Bytes per second this instance may admit for the tenant.
    fn limit(&self, tenant: &str) -> f64;
    /// Bucket capacity in bytes for the tenant.
    fn burst(&self, tenant: &str) -> usize;
}

pub struct LocalRateStrategy {
    overrides: Arc<Overrides>,
}

impl LocalRateStrategy {
    pub fn new(overrides: Arc<Overrides>) -> Self {
        LocalRateStrategy { overrides }
    }
}

impl RateLimiterStrategy for LocalRateStrategy {
    fn limit(&self, tenant: &str) -> f64 {
        self.overrides.limits(tenant).ingestion_rate_limit_bytes as f64
    }

    fn burst(&self, tenant: &str) -> usize {
        self.overrides.limits(tenant).ingestion_burst_size_bytes
    }
}

/// Splits the tenant limit across the distributor ring. The distributors
/// form a ring purely so each can count its healthy peers.
pub struct GlobalRateStrategy {
    overrides: Arc<Overrides>,
    distributor_ring: Ring,
}

impl GlobalRateStrategy {
    pub fn new(overrides: Arc<Overrides>, distributor_ring: Ring) -> Self {
        GlobalRateStrategy {
            overrides,
            distributor_ring,
        }
    }

    fn ring_size(&self) -> usize {
        self.distributor_ring.healthy_instances(Op::Write).len().max(1)
    }
}

impl RateLimiterStrategy for GlobalRateStrategy {
    fn limit(&self, tenant: &str) -> f64 {
        let limit = self.overrides.limits(tenant).ingestion_rate_limit_bytes as f64;
        limit / self.ring_size() as f64
    }

    fn burst(&self, tenant: &str) -> usize {
        self.overrides.limits(tenant).ingestion_burst_size_bytes
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket per tenant. Buckets start full (at burst) and refill at the
/// strategy's rate.
pub struct RateLimiter {
    strategy: Box<dyn RateLimiterStrategy>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(strategy: Box<dyn RateLimiterStrategy>) -> Self {
        RateLimiter {
            strategy,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admits `n` bytes for `tenant` at time `now`, or rejects them leaving
    /// the bucket untouched.
    pub fn allow_n(&self, now: Instant, tenant: &str, n: usize) -> bool {
        let limit = self.strategy.limit(tenant);
        let burst = self.strategy.burst(tenant) as f64;

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant.to_string()).or_insert(Bucket {
            tokens: burst,
            last: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limit).min(burst);
        bucket.last = now;

        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// The current per-instance limit, for error messages.
    pub fn limit(&self, tenant: &str) -> f64 {
        self.strategy.limit(tenant)
    }
}
