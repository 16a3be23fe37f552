// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingester's RPC surface: PushBytes, FindTraceByID, TransferOut and
//! the readiness endpoint, served over plain HTTP/1.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use prost::Message;
use spanvault_model::id::trace_id_from_hex;
use spanvault_model::PushBytesRequest;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::ingester::{Ingester, IngesterState};
use crate::IngestError;

const PUSH_ENDPOINT_PATH: &str = "/ingester/v1/push";
const TRACE_ENDPOINT_PREFIX: &str = "/ingester/v1/trace/";
const TRANSFER_OUT_ENDPOINT_PATH: &str = "/ingester/v1/transfer-out";
const READY_ENDPOINT_PATH: &str = "/ready";

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Accept loop in the usual shape: one task per connection in a JoinSet,
/// handler panics logged without killing the server.
pub async fn serve(ingester: Arc<Ingester>, listener: TcpListener) -> io::Result<()> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();
    let cancel = ingester.cancel.clone();

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
        let ingester = ingester.clone();
        joinset.spawn(async move {
            let service =
                service_fn(move |req| endpoint_handler(ingester.clone(), req));
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("connection error: {e}");
            }
        });
    }
}

async fn endpoint_handler(
    ingester: Arc<Ingester>,
    req: Request<hyper::body::Incoming>,
) -> http::Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, PUSH_ENDPOINT_PATH) => push_handler(ingester, req).await,
        (Method::GET, path) if path.starts_with(TRACE_ENDPOINT_PREFIX) => {
            trace_handler(ingester, path).await
        }
        (Method::POST, TRANSFER_OUT_ENDPOINT_PATH) => {
            match ingester.shutdown().await {
                Ok(()) => text_response(StatusCode::OK, "transfer complete"),
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        (Method::GET, READY_ENDPOINT_PATH) => {
            if ingester.state() == IngesterState::Active {
                text_response(StatusCode::OK, "ready")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::new()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

async fn push_handler(
    ingester: Arc<Ingester>,
    req: Request<hyper::body::Incoming>,
) -> http::Result<Response<Full<Bytes>>> {
    let tenant = match req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        Some(tenant) if !tenant.is_empty() => tenant,
        _ => return text_response(StatusCode::UNAUTHORIZED, "no tenant id on request"),
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("error reading push body: {e}"),
            )
        }
    };

    let push = match PushBytesRequest::decode(body.as_ref()) {
        Ok(push) => push,
        Err(e) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("error decoding push request: {e}"),
            )
        }
    };

    match ingester.push_bytes(&tenant, &push) {
        Ok(()) => text_response(StatusCode::OK, ""),
        Err(e) => text_response(push_error_status(&e), &e.to_string()),
    }
}

async fn trace_handler(
    ingester: Arc<Ingester>,
    path: &str,
) -> http::Result<Response<Full<Bytes>>> {
    let rest = &path[TRACE_ENDPOINT_PREFIX.len()..];
    let Some((tenant, hex_id)) = rest.split_once('/') else {
        return text_response(StatusCode::BAD_REQUEST, "expected /trace/<tenant>/<id>");
    };
    let trace_id = match trace_id_from_hex(hex_id) {
        Ok(id) => id,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match ingester.find_trace_by_id(tenant, &trace_id).await {
        Ok(Some(trace)) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Full::new(Bytes::from(trace.encode_to_vec()))),
        // absence is a valid result
        Ok(None) => text_response(StatusCode::NOT_FOUND, "trace not found"),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn push_error_status(e: &IngestError) -> StatusCode {
    match e {
        IngestError::LiveTracesExceeded { .. } | IngestError::TraceTooLarge { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        IngestError::NotAcceptingWrites => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::MisalignedRequest { .. } | IngestError::Model(_) => StatusCode::BAD_REQUEST,
        IngestError::Block(_) | IngestError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text_response(status: StatusCode, body: &str) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
}
