// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingester: per-tenant live-trace aggregation, the WAL-backed head
//! block, rotation into immutable blocks, upload, and point lookup over
//! everything it holds.

pub mod flush;
pub mod ingester;
pub mod instance;
pub mod metrics;
pub mod replay;
pub mod server;

pub use ingester::{Ingester, IngesterConfig, IngesterState};
pub use instance::TenantInstance;

use spanvault_backend::BackendError;
use spanvault_block::BlockError;
use spanvault_model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("LIVE_TRACES_EXCEEDED max live traces ({max}) exceeded for tenant {tenant}")]
    LiveTracesExceeded { tenant: String, max: usize },

    #[error("TRACE_TOO_LARGE max bytes per trace ({max}) exceeded while adding {size} bytes")]
    TraceTooLarge { max: usize, size: usize },

    #[error("ingester is not accepting writes")]
    NotAcceptingWrites,

    #[error("trace and id arrays are not aligned: {traces} traces, {ids} ids")]
    MisalignedRequest { traces: usize, ids: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
