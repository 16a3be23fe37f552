// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingester clients and the per-address client pool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use spanvault_model::id::trace_id_to_hex;
use spanvault_model::{PushBytesRequest, Trace};

use crate::ClientError;

/// The write/read RPC surface an ingester exposes to the distributor and
/// queriers.
#[async_trait]
pub trait IngesterClient: Send + Sync {
    async fn push_bytes(&self, tenant: &str, req: PushBytesRequest) -> Result<(), ClientError>;

    async fn find_trace_by_id(
        &self,
        tenant: &str,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, ClientError>;
}

/// HTTP transport for [`IngesterClient`], matching the ingester's hyper
/// surface.
pub struct HttpIngesterClient {
    base_url: String,
    http: reqwest::Client,
}

pub const TENANT_HEADER: &str = "x-tenant-id";

impl HttpIngesterClient {
    pub fn new(addr: &str) -> Self {
        HttpIngesterClient {
            base_url: format!("http://{addr}"),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IngesterClient for HttpIngesterClient {
    async fn push_bytes(&self, tenant: &str, req: PushBytesRequest) -> Result<(), ClientError> {
        let url = format!("{}/ingester/v1/push", self.base_url);
        let response = self
            .http
            .post(&url)
            .header(TENANT_HEADER, tenant)
            .body(req.encode_to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("unreadable error body: {e}"));
        Err(ClientError::Remote(body))
    }

    async fn find_trace_by_id(
        &self,
        tenant: &str,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, ClientError> {
        let url = format!(
            "{}/ingester/v1/trace/{}/{}",
            self.base_url,
            tenant,
            trace_id_to_hex(trace_id)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("unreadable error body: {e}"));
            return Err(ClientError::Remote(body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let trace =
            Trace::decode(bytes.as_ref()).map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Some(trace))
    }
}

pub type ClientFactory = Arc<dyn Fn(&str) -> Arc<dyn IngesterClient> + Send + Sync>;

/// Caches one client per ingester address. The factory seam lets tests wire
/// in-process fakes.
#[derive(Clone)]
pub struct ClientPool {
    factory: ClientFactory,
    clients: Arc<Mutex<HashMap<String, Arc<dyn IngesterClient>>>>,
}

impl ClientPool {
    pub fn new(factory: ClientFactory) -> Self {
        ClientPool {
            factory,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(|addr| Arc::new(HttpIngesterClient::new(addr))))
    }

    pub fn get_client_for(&self, addr: &str) -> Arc<dyn IngesterClient> {
        let mut clients = self.clients.lock();
        clients
            .entry(addr.to_string())
            .or_insert_with(|| (self.factory)(addr))
            .clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}
