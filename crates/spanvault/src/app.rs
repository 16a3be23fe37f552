// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Role wiring: builds the storage stack and the requested components, then
//! hands them to the service manager.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::ValueEnum;
use spanvault_backend::{
    CachedBackend, HedgedReader, LocalBackend, MemoryBackend, MemoryCache, RawReader, RawWriter,
};
use spanvault_block::BlockConfig;
use spanvault_compactor::{Compactor, CompactorConfig};
use spanvault_distributor::{
    ClientPool, Distributor, DistributorConfig, GlobalRateStrategy, LocalRateStrategy,
    RateLimiter, RateLimiterStrategy,
};
use spanvault_ingester::{Ingester, IngesterConfig};
use spanvault_model::overrides::IngestionRateStrategy;
use spanvault_model::TraceCombiner;
use spanvault_ring::{Lifecycler, LifecyclerConfig, Ring, RingConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{BackendKind, CacheKind, Config};
use crate::http::{self, InProcessIngesterClient};
use crate::services::ServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    All,
    Distributor,
    Ingester,
    Querier,
    QueryFrontend,
    Compactor,
}

#[derive(Debug)]
pub struct App {
    cfg: Config,
    target: Target,
}

impl App {
    pub fn new(mut cfg: Config, target: Target) -> anyhow::Result<Self> {
        match target {
            Target::Querier | Target::QueryFrontend => {
                anyhow::bail!(
                    "target {:?} is served by a separate component and is not compiled into this binary",
                    target
                );
            }
            Target::All => {
                // single binary: one replica of everything, in process
                cfg.ring.replication_factor = 1;
            }
            _ => {}
        }
        Ok(App { cfg, target })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let cfg = &self.cfg;
        let mut manager = ServiceManager::new();
        let cancel = CancellationToken::new();

        let (store_reader, store_writer) = build_storage(cfg)?;
        let combiner = Arc::new(TraceCombiner);
        let overrides = Arc::new(cfg.overrides.clone());

        let ingester_ring = Ring::new(RingConfig {
            replication_factor: cfg.ring.replication_factor,
            heartbeat_timeout: cfg.ring.heartbeat_timeout,
        });

        let instance_id = format!("{:?}-{}", self.target, Uuid::new_v4()).to_lowercase();

        // status surface is common to every role
        let status_addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.status_listen_port));
        let status_listener = TcpListener::bind(status_addr)
            .await
            .with_context(|| format!("binding status listener on {status_addr}"))?;
        info!(%status_addr, "status endpoints listening");
        {
            let cancel = cancel.clone();
            manager.spawn("status", async move {
                http::serve_status(status_listener, cancel)
                    .await
                    .map_err(Into::into)
            });
        }

        let run_ingester = matches!(self.target, Target::All | Target::Ingester);
        let run_distributor = matches!(self.target, Target::All | Target::Distributor);
        let run_compactor = matches!(self.target, Target::All | Target::Compactor);

        let mut ingester_handle: Option<Arc<Ingester>> = None;

        if run_ingester {
            let lifecycler = Lifecycler::new(
                ingester_ring.clone(),
                LifecyclerConfig {
                    id: instance_id.clone(),
                    addr: format!("127.0.0.1:{}", cfg.ingester.listen_port),
                    num_tokens: cfg.ingester.num_tokens,
                    heartbeat_period: cfg.ingester.heartbeat_period,
                    tokens_file_path: Some(cfg.storage.wal_path.join("tokens.json")),
                },
            );

            let ingester = Ingester::new(
                ingester_config(cfg),
                overrides.clone(),
                combiner.clone(),
                store_reader.clone(),
                store_writer.clone(),
                lifecycler,
            )?;
            ingester.start().await.context("starting ingester")?;

            let addr = SocketAddr::from(([0, 0, 0, 0], cfg.ingester.listen_port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding ingester listener on {addr}"))?;
            info!(%addr, "ingester listening");

            let serve_ingester = ingester.clone();
            manager.spawn("ingester", async move {
                spanvault_ingester::server::serve(serve_ingester, listener)
                    .await
                    .map_err(Into::into)
            });
            let stop_ingester = ingester.clone();
            manager.on_stop("ingester", move || async move {
                if let Err(e) = stop_ingester.shutdown().await {
                    tracing::error!(error = %e, "ingester shutdown failed");
                }
            });

            ingester_handle = Some(ingester);
        }

        if run_distributor {
            let pool = match (&ingester_handle, self.target) {
                (Some(ingester), Target::All) => {
                    let ingester = ingester.clone();
                    ClientPool::new(Arc::new(move |_addr| {
                        Arc::new(InProcessIngesterClient::new(ingester.clone()))
                            as Arc<dyn spanvault_distributor::IngesterClient>
                    }))
                }
                _ => ClientPool::http(),
            };

            let strategy: Box<dyn RateLimiterStrategy> =
                match overrides.defaults.ingestion_rate_strategy {
                    IngestionRateStrategy::Local => {
                        Box::new(LocalRateStrategy::new(overrides.clone()))
                    }
                    IngestionRateStrategy::Global => {
                        // distributors form a ring purely to count peers
                        let distributor_ring = Ring::new(RingConfig {
                            replication_factor: 1,
                            heartbeat_timeout: cfg.ring.heartbeat_timeout,
                        });
                        let lifecycler = Lifecycler::new(
                            distributor_ring.clone(),
                            LifecyclerConfig {
                                id: instance_id.clone(),
                                addr: String::new(),
                                num_tokens: 1,
                                heartbeat_period: cfg.ingester.heartbeat_period,
                                tokens_file_path: None,
                            },
                        );
                        lifecycler.join().context("joining distributor ring")?;
                        lifecycler.activate().context("activating in distributor ring")?;
                        Box::new(GlobalRateStrategy::new(overrides.clone(), distributor_ring))
                    }
                };

            let distributor = Arc::new(Distributor::new(
                DistributorConfig {
                    log_received_traces: cfg.distributor.log_received_traces,
                    extend_writes: cfg.distributor.extend_writes,
                    remote_timeout: cfg.distributor.remote_timeout,
                },
                ingester_ring.clone(),
                pool,
                RateLimiter::new(strategy),
            ));

            let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.http_listen_port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding distributor listener on {addr}"))?;
            info!(%addr, "distributor listening");

            let cancel = cancel.clone();
            manager.spawn("distributor", async move {
                http::serve_distributor(distributor, listener, cancel)
                    .await
                    .map_err(Into::into)
            });
        }

        if run_compactor {
            let compactor_ring = Ring::new(RingConfig {
                replication_factor: 1,
                heartbeat_timeout: cfg.ring.heartbeat_timeout,
            });
            let lifecycler = Lifecycler::new(
                compactor_ring.clone(),
                LifecyclerConfig {
                    id: instance_id.clone(),
                    addr: String::new(),
                    num_tokens: cfg.ingester.num_tokens,
                    tokens_file_path: None,
                    heartbeat_period: cfg.ingester.heartbeat_period,
                },
            );
            lifecycler.join().context("joining compactor ring")?;
            lifecycler.activate().context("activating in compactor ring")?;

            let compactor = Compactor::new(
                CompactorConfig {
                    max_compaction_input_bytes: cfg.compactor.max_compaction_input_bytes,
                    max_inputs_per_job: cfg.compactor.max_inputs_per_job,
                    max_compaction_objects: cfg.compactor.max_compaction_objects,
                    compaction_window: cfg.compactor.compaction_window,
                    deletion_grace: cfg.compactor.deletion_grace,
                    blocklist_poll: cfg.storage.blocklist_poll,
                    block: block_config(cfg),
                },
                &instance_id,
                compactor_ring,
                store_reader.clone(),
                store_writer.clone(),
                combiner.clone(),
                overrides.clone(),
            );

            let compactor_cancel = compactor.cancel_token();
            manager.spawn("compactor", async move {
                compactor.run().await;
                Ok(())
            });
            manager.on_stop("compactor", move || async move {
                compactor_cancel.cancel();
            });
        }

        {
            let cancel = cancel.clone();
            manager.on_stop("listeners", move || async move { cancel.cancel() });
        }

        manager.run().await
    }
}

fn ingester_config(cfg: &Config) -> IngesterConfig {
    IngesterConfig {
        max_block_duration: cfg.ingester.max_block_duration,
        max_block_bytes: cfg.ingester.max_block_bytes,
        trace_idle_period: cfg.ingester.trace_idle_period,
        max_trace_idle: cfg.ingester.max_trace_idle,
        flush_check_period: cfg.ingester.flush_check_period,
        complete_block_timeout: cfg.ingester.complete_block_timeout,
        concurrent_flushes: cfg.ingester.concurrent_flushes,
        flush_queue_depth: cfg.ingester.flush_queue_depth,
        wal_path: cfg.storage.wal_path.clone(),
        blocks_path: cfg.storage.blocks_path.clone(),
        block: block_config(cfg),
    }
}

fn block_config(cfg: &Config) -> BlockConfig {
    BlockConfig {
        target_page_size: cfg.storage.block_target_page_size,
        encoding: spanvault_backend::Encoding::Zstd,
        bloom_shard_count: cfg.storage.block_bloom_shard_count,
        bloom_false_positive: cfg.storage.block_bloom_false_positive,
    }
}

/// Builds the backend stack: the raw store, then the cache decorator, then
/// hedged reads, innermost first.
fn build_storage(cfg: &Config) -> anyhow::Result<(Arc<dyn RawReader>, Arc<dyn RawWriter>)> {
    let (mut reader, mut writer): (Arc<dyn RawReader>, Arc<dyn RawWriter>) =
        match cfg.storage.backend {
            BackendKind::Local => {
                let backend = Arc::new(
                    LocalBackend::new(&cfg.storage.local_path)
                        .context("creating local storage backend")?,
                );
                (backend.clone(), backend)
            }
            BackendKind::Memory => {
                let backend = Arc::new(MemoryBackend::new());
                (backend.clone(), backend)
            }
            BackendKind::S3 | BackendKind::Gcs | BackendKind::Azure => {
                anyhow::bail!(
                    "storage backend {:?} is provided by a separate component and is not compiled into this binary",
                    cfg.storage.backend
                );
            }
        };

    if let Some(cache) = cfg.storage.cache {
        let store = match cache {
            CacheKind::Memory => Arc::new(MemoryCache::new(cfg.storage.cache_max_items)),
            CacheKind::Memcached | CacheKind::Redis => {
                anyhow::bail!(
                    "cache {:?} is provided by a separate component; use \"memory\"",
                    cache
                );
            }
        };
        let cached = Arc::new(CachedBackend::new(reader, writer, store));
        reader = cached.clone();
        writer = cached;
    }

    if !cfg.storage.hedge_requests_at.is_zero() {
        reader = Arc::new(HedgedReader::new(reader, cfg.storage.hedge_requests_at));
    }

    Ok((reader, writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_querier_target_rejected() {
        let err = App::new(Config::default(), Target::Querier).unwrap_err();
        assert!(err.to_string().contains("separate component"));
    }

    #[test]
    fn test_all_target_forces_single_replica() {
        let mut cfg = Config::default();
        cfg.ring.replication_factor = 3;
        let app = App::new(cfg, Target::All).unwrap();
        assert_eq!(app.cfg.ring.replication_factor, 1);
    }

    #[test]
    fn test_build_storage_rejects_uncompiled_backends() {
        let mut cfg = Config::default();
        cfg.storage.backend = BackendKind::S3;
        assert!(build_storage(&cfg).is_err());
    }

    #[test]
    fn test_build_storage_memory_with_cache_and_hedging() {
        let mut cfg = Config::default();
        cfg.storage.backend = BackendKind::Memory;
        cfg.storage.cache = Some(CacheKind::Memory);
        cfg.storage.hedge_requests_at = std::time::Duration::from_millis(500);
        assert!(build_storage(&cfg).is_ok());
    }
}
