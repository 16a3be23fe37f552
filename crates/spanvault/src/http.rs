// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP plumbing owned by the binary: the distributor's push surface, the
//! status endpoints, and the in-process ingester client used by the single
//! binary.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use prost::Message;
use spanvault_distributor::{ClientError, Distributor, IngesterClient, PushError};
use spanvault_ingester::Ingester;
use spanvault_model::{PushBytesRequest, ResourceSpans, Trace};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const TENANT_HEADER: &str = "x-tenant-id";
const PUSH_ENDPOINT_PATH: &str = "/distributor/v1/push";
const READY_ENDPOINT_PATH: &str = "/ready";
const METRICS_ENDPOINT_PATH: &str = "/metrics";

/// Routes writes straight into a colocated ingester, the single-binary
/// equivalent of the HTTP client. Error strings keep their prefixes so the
/// distributor's discard classification is unchanged.
pub struct InProcessIngesterClient {
    ingester: Arc<Ingester>,
}

impl InProcessIngesterClient {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        InProcessIngesterClient { ingester }
    }
}

#[async_trait]
impl IngesterClient for InProcessIngesterClient {
    async fn push_bytes(&self, tenant: &str, req: PushBytesRequest) -> Result<(), ClientError> {
        self.ingester
            .push_bytes(tenant, &req)
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn find_trace_by_id(
        &self,
        tenant: &str,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, ClientError> {
        self.ingester
            .find_trace_by_id(tenant, trace_id)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }
}

/// Serves the distributor push endpoint plus `/ready`.
pub async fn serve_distributor(
    distributor: Arc<Distributor>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> io::Result<()> {
    serve(listener, cancel, move |req| {
        let distributor = distributor.clone();
        async move { distributor_handler(distributor, req).await }
    })
    .await
}

/// Serves `/ready` and `/metrics` for any role.
pub async fn serve_status(
    listener: TcpListener,
    cancel: CancellationToken,
) -> io::Result<()> {
    serve(listener, cancel, move |req| async move {
        status_handler(req).await
    })
    .await
}

async fn distributor_handler(
    distributor: Arc<Distributor>,
    req: Request<hyper::body::Incoming>,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method().clone(), req.uri().path()) {
        (Method::POST, PUSH_ENDPOINT_PATH) => {
            let tenant = req
                .headers()
                .get(TENANT_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        &format!("error reading push body: {e}"),
                    )
                }
            };
            let batch = match ResourceSpans::decode(body.as_ref()) {
                Ok(batch) => batch,
                Err(e) => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        &format!("error decoding batch: {e}"),
                    )
                }
            };

            match distributor.push(&tenant, batch).await {
                Ok(()) => text_response(StatusCode::OK, ""),
                Err(e) => text_response(push_error_status(&e), &e.to_string()),
            }
        }
        (Method::GET, READY_ENDPOINT_PATH) => text_response(StatusCode::OK, "ready"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn status_handler(
    req: Request<hyper::body::Incoming>,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, READY_ENDPOINT_PATH) => text_response(StatusCode::OK, "ready"),
        (Method::GET, METRICS_ENDPOINT_PATH) => {
            use prometheus::Encoder;
            let encoder = prometheus::TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("metrics encoding failed: {e}"),
                );
            }
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn push_error_status(e: &PushError) -> StatusCode {
    match e {
        PushError::Unauthenticated => StatusCode::UNAUTHORIZED,
        PushError::InvalidArgument => StatusCode::BAD_REQUEST,
        PushError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        PushError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text_response(status: StatusCode, body: &str) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
}

async fn serve<H, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    handler: H,
) -> io::Result<()>
where
    H: Fn(Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = http::Result<Response<Full<Bytes>>>> + Send + 'static,
{
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            conn_res = listener.accept() => match conn_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("connection handler panicked: {e:?}");
                    }
                }
                continue;
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let handler = handler.clone();
        joinset.spawn(async move {
            let service = service_fn(move |req| handler(req));
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("connection error: {e}");
            }
        });
    }
}
