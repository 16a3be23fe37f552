// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Manages one instance's membership in a ring across its lifetime:
//! JOINING on startup, ACTIVE once ready, LEAVING on graceful shutdown.
//! Tokens are random at first bootstrap and persisted to disk so the same
//! instance reclaims the same ring ranges after a restart.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ring::{InstanceDesc, InstanceState, Ring};
use crate::RingError;

#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    pub id: String,
    pub addr: String,
    pub num_tokens: usize,
    pub heartbeat_period: Duration,
    /// Where to persist this instance's tokens. `None` disables persistence
    /// (tests, ephemeral deployments).
    pub tokens_file_path: Option<PathBuf>,
}

pub struct Lifecycler {
    ring: Ring,
    cfg: LifecyclerConfig,
    cancel: CancellationToken,
}

impl Lifecycler {
    pub fn new(ring: Ring, cfg: LifecyclerConfig) -> Self {
        Lifecycler {
            ring,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Registers this instance as JOINING and starts heartbeating.
    pub fn join(&self) -> Result<(), RingError> {
        let tokens = self.load_or_generate_tokens()?;
        debug!(id = %self.cfg.id, tokens = tokens.len(), "joining ring");

        self.ring.register(InstanceDesc {
            id: self.cfg.id.clone(),
            addr: self.cfg.addr.clone(),
            state: InstanceState::Joining,
            tokens,
            last_heartbeat: Instant::now(),
        });

        let ring = self.ring.clone();
        let id = self.cfg.id.clone();
        let period = self.cfg.heartbeat_period;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = ring.heartbeat(&id) {
                            warn!(id = %id, error = %e, "heartbeat failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    /// JOINING -> ACTIVE, once startup (e.g. WAL replay) has completed.
    pub fn activate(&self) -> Result<(), RingError> {
        self.ring.set_state(&self.cfg.id, InstanceState::Active)
    }

    /// ACTIVE -> LEAVING: stop taking writes, keep serving reads.
    pub fn begin_leaving(&self) -> Result<(), RingError> {
        self.ring.set_state(&self.cfg.id, InstanceState::Leaving)
    }

    /// Final exit: removes the instance and stops the heartbeat task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.ring.remove(&self.cfg.id);
    }

    fn load_or_generate_tokens(&self) -> Result<Vec<u32>, RingError> {
        if let Some(path) = &self.cfg.tokens_file_path {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let tokens: Vec<u32> = serde_json::from_slice(&bytes)?;
                    if tokens.len() == self.cfg.num_tokens {
                        debug!(path = %path.display(), "reusing persisted ring tokens");
                        return Ok(tokens);
                    }
                    warn!(
                        path = %path.display(),
                        "persisted token count does not match config, regenerating"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RingError::TokensFile(e)),
            }
        }

        let mut rng = rand::thread_rng();
        let mut tokens: Vec<u32> = (0..self.cfg.num_tokens).map(|_| rng.gen()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        while tokens.len() < self.cfg.num_tokens {
            tokens.push(rng.gen());
            tokens.sort_unstable();
            tokens.dedup();
        }

        if let Some(path) = &self.cfg.tokens_file_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_vec(&tokens)?)?;
        }
        Ok(tokens)
    }
}
