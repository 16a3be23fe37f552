// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token-based consistent hash ring: ownership, replica selection and the
//! quorum fan-out primitive. The membership document lives in process and is
//! shared by every component of a node; gossip or external KV transports are
//! collaborator components that would replicate the same document.

mod batch;
mod lifecycler;
mod ring;

pub use batch::{do_batch, BatchError};
pub use lifecycler::{Lifecycler, LifecyclerConfig};
pub use ring::{InstanceDesc, InstanceState, Op, Ring, RingConfig};

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("empty ring")]
    EmptyRing,

    #[error("at least {required} healthy instances required, have {have}")]
    TooFewHealthy { required: usize, have: usize },

    #[error("instance {0} not found in ring")]
    UnknownInstance(String),

    #[error("tokens file: {0}")]
    TokensFile(#[from] std::io::Error),

    #[error("tokens file: {0}")]
    TokensFileFormat(#[from] serde_json::Error),
}
