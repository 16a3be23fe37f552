// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The distributor: per-tenant admission control, trace-id-keyed sharding
//! over the ingester ring, and replicated write dispatch.

pub mod client;
pub mod distributor;
pub mod limit;
pub mod metrics;

pub use client::{ClientPool, HttpIngesterClient, IngesterClient};
pub use distributor::{Distributor, DistributorConfig, PushError};
pub use limit::{GlobalRateStrategy, LocalRateStrategy, RateLimiter, RateLimiterStrategy};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// An error the remote ingester produced; the message carries the
    /// machine-readable prefix used for discard classification.
    #[error("{0}")]
    Remote(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("remote timeout exceeded")]
    Timeout,
}
