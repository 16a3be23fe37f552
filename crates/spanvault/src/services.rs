// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service lifecycle graph.
//!
//! Every subservice moves through NEW -> STARTING -> RUNNING -> STOPPING ->
//! TERMINATED (or FAILED). The manager starts services in registration
//! order, watches for failures over a channel, and stops everything in
//! reverse order; one failed subservice fails the parent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct ServiceManager {
    states: Arc<RwLock<HashMap<String, ServiceState>>>,
    failure_tx: mpsc::UnboundedSender<(String, anyhow::Error)>,
    failure_rx: mpsc::UnboundedReceiver<(String, anyhow::Error)>,
    stops: Vec<(String, StopFn)>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        ServiceManager {
            states: Arc::new(RwLock::new(HashMap::new())),
            failure_tx,
            failure_rx,
            stops: Vec::new(),
        }
    }

    pub fn state_of(&self, name: &str) -> ServiceState {
        self.states
            .read()
            .get(name)
            .copied()
            .unwrap_or(ServiceState::New)
    }

    pub fn all_running(&self) -> bool {
        let states = self.states.read();
        !states.is_empty() && states.values().all(|s| *s == ServiceState::Running)
    }

    /// Spawns a long-running service. The future should only resolve on
    /// shutdown; resolving with an error marks the service FAILED and fails
    /// the whole process.
    pub fn spawn<F>(&mut self, name: &str, service: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.states
            .write()
            .insert(name.to_string(), ServiceState::Starting);
        info!(service = name, "starting service");

        self.states
            .write()
            .insert(name.to_string(), ServiceState::Running);

        let states = self.states.clone();
        let failure_tx = self.failure_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match service.await {
                Ok(()) => {
                    states
                        .write()
                        .insert(name.clone(), ServiceState::Terminated);
                }
                Err(e) => {
                    states.write().insert(name.clone(), ServiceState::Failed);
                    let _ = failure_tx.send((name, e));
                }
            }
        });
    }

    /// Registers the graceful-stop action for a service. Stops run in
    /// reverse registration order.
    pub fn on_stop<F, Fut>(&mut self, name: &str, stop: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stops
            .push((name.to_string(), Box::new(move || Box::pin(stop()))));
    }

    /// Runs until a shutdown signal or a subservice failure. Either way,
    /// registered stops run in reverse order before returning.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                Ok(())
            }
            failed = self.failure_rx.recv() => match failed {
                Some((name, e)) => {
                    error!(service = %name, error = %e, "subservice failed");
                    Err(anyhow::anyhow!("subservice {name} failed: {e}"))
                }
                None => Ok(()),
            }
        };

        self.stop_all().await;
        outcome
    }

    async fn stop_all(&mut self) {
        for (name, stop) in self.stops.drain(..).rev() {
            info!(service = %name, "stopping service");
            self.states
                .write()
                .insert(name.clone(), ServiceState::Stopping);
            stop().await;
            self.states.write().insert(name, ServiceState::Terminated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_failure_stops_in_reverse_order() {
        let mut manager = ServiceManager::new();
        let stop_order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            manager.spawn(name, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            });
            let stop_order = stop_order.clone();
            manager.on_stop(name, move || async move {
                stop_order.lock().push(name);
            });
        }

        manager.spawn("failing", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            anyhow::bail!("boom")
        });

        let result = manager.run().await;
        assert!(result.is_err());
        assert_eq!(*stop_order.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_states_tracked() {
        let mut manager = ServiceManager::new();
        assert_eq!(manager.state_of("nope"), ServiceState::New);

        let stopped = Arc::new(AtomicUsize::new(0));
        manager.spawn("svc", async { Ok(()) });
        let stopped2 = stopped.clone();
        manager.on_stop("svc", move || async move {
            stopped2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(manager.state_of("svc"), ServiceState::Running);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state_of("svc"), ServiceState::Terminated);
    }
}
