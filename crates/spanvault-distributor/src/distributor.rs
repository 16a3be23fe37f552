// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The push path: admission, regrouping by trace id, replicated dispatch.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prost::Message;
use spanvault_model::id::trace_id_to_hex;
use spanvault_model::overrides::{
    ERROR_PREFIX_LIVE_TRACES_EXCEEDED, ERROR_PREFIX_TRACE_TOO_LARGE,
};
use spanvault_model::{
    extend_token, token_for, validate_trace_id, PushBytesRequest, ResourceSpans, ScopeSpans, Trace,
};
use spanvault_ring::{do_batch, BatchError, Op, Ring};
use tracing::debug;

use crate::client::ClientPool;
use crate::limit::RateLimiter;
use crate::metrics::{
    METRIC_BYTES_INGESTED, METRIC_DISCARDED_SPANS, METRIC_INGESTER_APPENDS,
    METRIC_INGESTER_APPEND_FAILURES, METRIC_SPANS_INGESTED, METRIC_TRACES_PER_BATCH,
    REASON_INTERNAL_ERROR, REASON_LIVE_TRACES_EXCEEDED, REASON_RATE_LIMITED,
    REASON_TRACE_TOO_LARGE,
};
use crate::ClientError;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("no tenant id on request")]
    Unauthenticated,

    #[error("trace ids must be 128 bit")]
    InvalidArgument,

    #[error("RATE_LIMITED ingestion rate limit ({limit} bytes) exceeded while adding {size} bytes")]
    ResourceExhausted { limit: usize, size: usize },

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Log every received span at debug level.
    pub log_received_traces: bool,
    /// Use `Write` instead of `WriteNoExtend` so JOINING spares are skipped.
    pub extend_writes: bool,
    /// Per-ingester RPC timeout, applied on a context detached from the
    /// caller so one client's cancellation cannot abort another's fan-out.
    pub remote_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        DistributorConfig {
            log_received_traces: false,
            extend_writes: true,
            remote_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Distributor {
    cfg: DistributorConfig,
    ingesters_ring: Ring,
    pool: ClientPool,
    ingestion_rate_limiter: RateLimiter,
}

impl Distributor {
    pub fn new(
        cfg: DistributorConfig,
        ingesters_ring: Ring,
        pool: ClientPool,
        ingestion_rate_limiter: RateLimiter,
    ) -> Self {
        Distributor {
            cfg,
            ingesters_ring,
            pool,
            ingestion_rate_limiter,
        }
    }

    /// Accepts one batch for a tenant and dispatches it to the owning
    /// ingesters. Success means every trace in the batch reached write
    /// quorum.
    pub async fn push(&self, tenant: &str, batch: ResourceSpans) -> Result<(), PushError> {
        if tenant.is_empty() {
            // no tenant to attribute discarded spans to
            return Err(PushError::Unauthenticated);
        }

        if self.cfg.log_received_traces {
            log_traces(&batch);
        }

        let size = batch.encoded_len();
        METRIC_BYTES_INGESTED
            .with_label_values(&[tenant])
            .inc_by(size as u64);

        let span_count: usize = batch.scope_spans.iter().map(|ss| ss.spans.len()).sum();
        if span_count == 0 {
            return Ok(());
        }
        METRIC_SPANS_INGESTED
            .with_label_values(&[tenant])
            .inc_by(span_count as u64);

        let now = Instant::now();
        if !self.ingestion_rate_limiter.allow_n(now, tenant, size) {
            METRIC_DISCARDED_SPANS
                .with_label_values(&[REASON_RATE_LIMITED, tenant])
                .inc_by(span_count as u64);
            return Err(PushError::ResourceExhausted {
                limit: self.ingestion_rate_limiter.limit(tenant) as usize,
                size,
            });
        }

        let (keys, traces, ids) = match requests_by_trace_id(&batch, tenant, span_count) {
            Ok(grouped) => grouped,
            Err(e) => {
                METRIC_DISCARDED_SPANS
                    .with_label_values(&[REASON_INTERNAL_ERROR, tenant])
                    .inc_by(span_count as u64);
                return Err(e);
            }
        };

        let result = self
            .send_to_ingesters_via_bytes(tenant, traces, keys, ids)
            .await;
        if let Err(e) = &result {
            record_discarded_spans(e, tenant, span_count);
        }
        result
    }

    async fn send_to_ingesters_via_bytes(
        &self,
        tenant: &str,
        traces: Vec<Trace>,
        keys: Vec<u32>,
        ids: Vec<Vec<u8>>,
    ) -> Result<(), PushError> {
        // marshal each trace exactly once, before the fan-out
        let marshaled: Vec<Vec<u8>> = traces.iter().map(Message::encode_to_vec).collect();

        let op = if self.cfg.extend_writes {
            Op::Write
        } else {
            Op::WriteNoExtend
        };

        let result = do_batch(&self.ingesters_ring, op, &keys, |ingester, indexes| {
            let req = PushBytesRequest {
                traces: indexes.iter().map(|&j| marshaled[j].clone()).collect(),
                ids: indexes.iter().map(|&j| ids[j].clone()).collect(),
                search_data: Vec::new(),
            };
            let pool = self.pool.clone();
            let tenant = tenant.to_string();
            let remote_timeout = self.cfg.remote_timeout;
            let addr = ingester.addr.clone();

            async move {
                METRIC_INGESTER_APPENDS.with_label_values(&[addr.as_str()]).inc();

                // detach from the caller: a spawned task keeps the RPC alive
                // even if this push's caller goes away mid-flight
                let handle = tokio::spawn(async move {
                    let client = pool.get_client_for(&addr);
                    match tokio::time::timeout(remote_timeout, client.push_bytes(&tenant, req))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::Timeout),
                    }
                });

                let result = match handle.await {
                    Ok(result) => result,
                    Err(join) => Err(ClientError::Transport(join.to_string())),
                };
                if result.is_err() {
                    METRIC_INGESTER_APPEND_FAILURES
                        .with_label_values(&[ingester.addr.as_str()])
                        .inc();
                }
                result
            }
        })
        .await;

        result.map_err(|e| match e {
            BatchError::Ring(ring) => PushError::Internal(ring.to_string()),
            BatchError::Remote(client) => PushError::Internal(client.to_string()),
        })
    }
}

/// Regroups one inbound batch by trace id: spans of the same `(trace,
/// scope)` coalesce into one [`ScopeSpans`], and each distinct trace id
/// yields one [`Trace`] sharing the batch's resource. Returns the ring keys,
/// traces and ids aligned by index.
fn requests_by_trace_id(
    batch: &ResourceSpans,
    tenant: &str,
    span_count: usize,
) -> Result<(Vec<u32>, Vec<Trace>, Vec<Vec<u8>>), PushError> {
    // p50 traces per batch observed in production; only an allocation hint
    const TRACES_PER_BATCH: usize = 20;

    struct TraceBuilder {
        id: Vec<u8>,
        // scope key -> position in `scopes`
        scope_index: HashMap<u32, usize>,
        scopes: Vec<ScopeSpans>,
    }

    let mut traces_by_key: HashMap<u32, TraceBuilder> =
        HashMap::with_capacity(TRACES_PER_BATCH);
    let mut key_order: Vec<u32> = Vec::with_capacity(TRACES_PER_BATCH);

    for ss in &batch.scope_spans {
        for span in &ss.spans {
            validate_trace_id(&span.trace_id).map_err(|_| PushError::InvalidArgument)?;

            let trace_key = token_for(tenant, &span.trace_id);
            let mut scope_key = trace_key;
            if let Some(scope) = &ss.scope {
                scope_key = extend_token(scope_key, scope.name.as_bytes());
                scope_key = extend_token(scope_key, scope.version.as_bytes());
            }

            let builder = traces_by_key.entry(trace_key).or_insert_with(|| {
                key_order.push(trace_key);
                TraceBuilder {
                    id: span.trace_id.clone(),
                    scope_index: HashMap::new(),
                    scopes: Vec::new(),
                }
            });

            let scope_pos = match builder.scope_index.get(&scope_key) {
                Some(&pos) => pos,
                None => {
                    builder.scopes.push(ScopeSpans {
                        scope: ss.scope.clone(),
                        spans: Vec::with_capacity(span_count / TRACES_PER_BATCH + 1),
                    });
                    let pos = builder.scopes.len() - 1;
                    builder.scope_index.insert(scope_key, pos);
                    pos
                }
            };
            builder.scopes[scope_pos].spans.push(span.clone());
        }
    }

    METRIC_TRACES_PER_BATCH.observe(traces_by_key.len() as f64);

    let mut keys = Vec::with_capacity(traces_by_key.len());
    let mut traces = Vec::with_capacity(traces_by_key.len());
    let mut ids = Vec::with_capacity(traces_by_key.len());

    for key in key_order {
        let builder = traces_by_key
            .remove(&key)
            .expect("key recorded without builder");
        keys.push(key);
        ids.push(builder.id);
        traces.push(Trace {
            batches: vec![ResourceSpans {
                resource: batch.resource.clone(),
                scope_spans: builder.scopes,
            }],
        });
    }

    Ok((keys, traces, ids))
}

fn record_discarded_spans(err: &PushError, tenant: &str, span_count: usize) {
    let desc = err.to_string();
    let reason = if desc.starts_with(ERROR_PREFIX_LIVE_TRACES_EXCEEDED) {
        REASON_LIVE_TRACES_EXCEEDED
    } else if desc.starts_with(ERROR_PREFIX_TRACE_TOO_LARGE) {
        REASON_TRACE_TOO_LARGE
    } else {
        REASON_INTERNAL_ERROR
    };
    METRIC_DISCARDED_SPANS
        .with_label_values(&[reason, tenant])
        .inc_by(span_count as u64);
}

fn log_traces(batch: &ResourceSpans) {
    for ss in &batch.scope_spans {
        for span in &ss.spans {
            debug!(
                traceid = %trace_id_to_hex(&span.trace_id),
                spanid = %hex::encode(&span.span_id),
                "received span"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientPool, IngesterClient};
    use crate::limit::{LocalRateStrategy, RateLimiter};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use spanvault_model::overrides::{Limits, Overrides, ERROR_PREFIX_RATE_LIMITED};
    use spanvault_model::Span;
    use spanvault_ring::{InstanceDesc, InstanceState, RingConfig};
    use std::sync::Arc;

    /// Records pushes per ingester address.
    #[derive(Default)]
    struct RecordingClient {
        pushes: Mutex<Vec<(String, PushBytesRequest)>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl IngesterClient for RecordingClient {
        async fn push_bytes(
            &self,
            tenant: &str,
            req: PushBytesRequest,
        ) -> Result<(), ClientError> {
            if let Some(msg) = &self.fail_with {
                return Err(ClientError::Remote(msg.clone()));
            }
            self.pushes.lock().push((tenant.to_string(), req));
            Ok(())
        }

        async fn find_trace_by_id(
            &self,
            _tenant: &str,
            _trace_id: &[u8],
        ) -> Result<Option<Trace>, ClientError> {
            Ok(None)
        }
    }

    fn ring_of(n: usize, rf: usize) -> Ring {
        let ring = Ring::new(RingConfig {
            replication_factor: rf,
            heartbeat_timeout: Duration::from_secs(60),
        });
        for i in 0..n {
            ring.register(InstanceDesc {
                id: format!("ingester-{i}"),
                addr: format!("ingester-{i}:3200"),
                state: InstanceState::Active,
                tokens: vec![(i as u32 + 1) * 10_000],
                last_heartbeat: Instant::now(),
            });
        }
        ring
    }

    fn distributor_with(
        clients: Arc<Mutex<HashMap<String, Arc<RecordingClient>>>>,
        ring: Ring,
        limits: Limits,
        fail_with: Option<String>,
    ) -> Distributor {
        let overrides = Arc::new(Overrides::new(limits));
        let pool = ClientPool::new(Arc::new(move |addr| {
            let client = Arc::new(RecordingClient {
                fail_with: fail_with.clone(),
                ..Default::default()
            });
            clients.lock().insert(addr.to_string(), client.clone());
            client
        }));
        Distributor::new(
            DistributorConfig::default(),
            ring,
            pool,
            RateLimiter::new(Box::new(LocalRateStrategy::new(overrides))),
        )
    }

    fn span(trace_id: &[u8], span_id: u8) -> Span {
        Span {
            trace_id: trace_id.to_vec(),
            span_id: vec![span_id; 8],
            name: "op".to_string(),
            ..Default::default()
        }
    }

    fn batch_of(spans: Vec<Span>) -> ResourceSpans {
        ResourceSpans {
            resource: None,
            scope_spans: vec![ScopeSpans { scope: None, spans }],
        }
    }

    #[tokio::test]
    async fn test_push_reaches_all_replicas() {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let distributor =
            distributor_with(clients.clone(), ring_of(3, 3), Limits::default(), None);

        let trace_id = {
            let mut id = vec![0u8; 16];
            id[0] = 0x01;
            id
        };
        let batch = batch_of(vec![
            span(&trace_id, 1),
            span(&trace_id, 2),
            span(&trace_id, 3),
        ]);

        distributor.push("a", batch).await.unwrap();

        let clients = clients.lock();
        assert_eq!(clients.len(), 3);
        for client in clients.values() {
            let pushes = client.pushes.lock();
            assert_eq!(pushes.len(), 1);
            let (tenant, req) = &pushes[0];
            assert_eq!(tenant, "a");
            assert_eq!(req.ids, vec![trace_id.clone()]);
            let trace = Trace::decode(req.traces[0].as_slice()).unwrap();
            assert_eq!(trace.span_count(), 3);
        }
    }

    #[tokio::test]
    async fn test_invalid_trace_id_never_reaches_ingesters() {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let distributor =
            distributor_with(clients.clone(), ring_of(3, 3), Limits::default(), None);

        let batch = batch_of(vec![span(&[0u8; 8], 1)]);
        let err = distributor.push("a", batch).await.unwrap_err();
        assert!(matches!(err, PushError::InvalidArgument));
        assert!(clients.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_tenant_rejected() {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let distributor =
            distributor_with(clients.clone(), ring_of(1, 1), Limits::default(), None);

        let err = distributor
            .push("", batch_of(vec![span(&[1u8; 16], 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_rate_limit_denies_second_push() {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let limits = Limits {
            ingestion_rate_limit_bytes: 100,
            ingestion_burst_size_bytes: 1500,
            ..Limits::default()
        };
        let distributor = distributor_with(clients.clone(), ring_of(1, 1), limits, None);

        // ~1.3 KB of spans: under the burst once, over it twice
        let big_batch = || {
            batch_of(
                (0..10u8)
                    .map(|i| {
                        let mut s = span(&[2u8; 16], i);
                        s.name = "x".repeat(100);
                        s
                    })
                    .collect(),
            )
        };
        let size = big_batch().encoded_len();
        assert!(size > 750 && size < 1500, "batch size {size} out of range");

        distributor.push("a", big_batch()).await.unwrap();
        let err = distributor.push("a", big_batch()).await.unwrap_err();
        assert!(matches!(err, PushError::ResourceExhausted { .. }));
        let msg = err.to_string();
        assert!(msg.starts_with(ERROR_PREFIX_RATE_LIMITED), "{msg}");
    }

    #[tokio::test]
    async fn test_remote_prefix_errors_classified() {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let distributor = distributor_with(
            clients.clone(),
            ring_of(1, 1),
            Limits::default(),
            Some(format!("{ERROR_PREFIX_TRACE_TOO_LARGE} max size exceeded")),
        );

        let before = METRIC_DISCARDED_SPANS
            .with_label_values(&[REASON_TRACE_TOO_LARGE, "classify-tenant"])
            .get();
        let err = distributor
            .push("classify-tenant", batch_of(vec![span(&[3u8; 16], 1)]))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with(ERROR_PREFIX_TRACE_TOO_LARGE));
        let after = METRIC_DISCARDED_SPANS
            .with_label_values(&[REASON_TRACE_TOO_LARGE, "classify-tenant"])
            .get();
        assert_eq!(after - before, 1);
    }

    #[test]
    fn test_requests_by_trace_id_groups_spans() {
        let id_a = [1u8; 16];
        let id_b = [2u8; 16];
        let batch = batch_of(vec![span(&id_a, 1), span(&id_b, 2), span(&id_a, 3)]);

        let (keys, traces, ids) = requests_by_trace_id(&batch, "tenant", 3).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(traces.len(), 2);
        assert_eq!(ids.len(), 2);

        let pos_a = ids.iter().position(|id| id == &id_a.to_vec()).unwrap();
        assert_eq!(traces[pos_a].span_count(), 2);
        assert_eq!(keys[pos_a], token_for("tenant", &id_a));

        let pos_b = ids.iter().position(|id| id == &id_b.to_vec()).unwrap();
        assert_eq!(traces[pos_b].span_count(), 1);
    }

    #[test]
    fn test_requests_by_trace_id_merges_scopes() {
        use spanvault_model::InstrumentationScope;

        let id = [7u8; 16];
        let scope = Some(InstrumentationScope {
            name: "lib".to_string(),
            version: "1".to_string(),
        });
        let batch = ResourceSpans {
            resource: None,
            scope_spans: vec![
                ScopeSpans {
                    scope: scope.clone(),
                    spans: vec![span(&id, 1)],
                },
                ScopeSpans {
                    scope: scope.clone(),
                    spans: vec![span(&id, 2)],
                },
                ScopeSpans {
                    scope: None,
                    spans: vec![span(&id, 3)],
                },
            ],
        };

        let (_, traces, _) = requests_by_trace_id(&batch, "tenant", 3).unwrap();
        assert_eq!(traces.len(), 1);
        // same (trace, scope) coalesced; the unscoped span gets its own group
        assert_eq!(traces[0].batches[0].scope_spans.len(), 2);
        assert_eq!(traces[0].span_count(), 3);
    }
}
