// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::RingError;

/// Ring operations. The states an instance may serve differ per operation:
/// a JOINING instance has no data yet so it can accept writes as a spare
/// during handoff, but must never serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Accepts ACTIVE and LEAVING instances.
    Write,
    /// Like [`Op::Write`] but also accepts JOINING spares, minimizing
    /// reshuffle writes during handoff.
    WriteNoExtend,
    /// Accepts ACTIVE and LEAVING instances; JOINING is excluded.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
    Unhealthy,
}

impl InstanceState {
    fn valid_for(self, op: Op) -> bool {
        match op {
            Op::Write | Op::Read => matches!(self, InstanceState::Active | InstanceState::Leaving),
            Op::WriteNoExtend => matches!(
                self,
                InstanceState::Active | InstanceState::Leaving | InstanceState::Joining
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub state: InstanceState,
    pub tokens: Vec<u32>,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub replication_factor: usize,
    pub heartbeat_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            replication_factor: 3,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct RingDesc {
    instances: HashMap<String, InstanceDesc>,
}

/// The shared membership view. Cloning a `Ring` shares the document.
#[derive(Clone)]
pub struct Ring {
    cfg: RingConfig,
    desc: Arc<RwLock<RingDesc>>,
}

impl Ring {
    pub fn new(cfg: RingConfig) -> Self {
        Ring {
            cfg,
            desc: Arc::new(RwLock::new(RingDesc::default())),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.cfg.replication_factor
    }

    pub fn register(&self, instance: InstanceDesc) {
        self.desc.write().instances.insert(instance.id.clone(), instance);
    }

    pub fn set_state(&self, id: &str, state: InstanceState) -> Result<(), RingError> {
        let mut desc = self.desc.write();
        let instance = desc
            .instances
            .get_mut(id)
            .ok_or_else(|| RingError::UnknownInstance(id.to_string()))?;
        instance.state = state;
        Ok(())
    }

    pub fn heartbeat(&self, id: &str) -> Result<(), RingError> {
        let mut desc = self.desc.write();
        let instance = desc
            .instances
            .get_mut(id)
            .ok_or_else(|| RingError::UnknownInstance(id.to_string()))?;
        instance.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        self.desc.write().instances.remove(id);
    }

    fn is_healthy(&self, instance: &InstanceDesc, now: Instant) -> bool {
        instance.state != InstanceState::Unhealthy
            && now.duration_since(instance.last_heartbeat) <= self.cfg.heartbeat_timeout
    }

    /// Instances currently able to serve `op`, in no particular order.
    pub fn healthy_instances(&self, op: Op) -> Vec<InstanceDesc> {
        let now = Instant::now();
        self.desc
            .read()
            .instances
            .values()
            .filter(|i| self.is_healthy(i, now) && i.state.valid_for(op))
            .cloned()
            .collect()
    }

    /// The replica set for a key: the first `replication_factor` distinct
    /// instances encountered walking clockwise from the key whose state is
    /// valid for `op` and whose heartbeat is fresh.
    pub fn get(&self, key: u32, op: Op) -> Result<Vec<InstanceDesc>, RingError> {
        let desc = self.desc.read();
        if desc.instances.is_empty() {
            return Err(RingError::EmptyRing);
        }

        let mut tokens: Vec<(u32, &str)> = desc
            .instances
            .values()
            .flat_map(|i| i.tokens.iter().map(move |t| (*t, i.id.as_str())))
            .collect();
        if tokens.is_empty() {
            return Err(RingError::EmptyRing);
        }
        tokens.sort_unstable();

        let now = Instant::now();
        let start = tokens.partition_point(|(t, _)| *t < key);

        let mut replicas: Vec<InstanceDesc> = Vec::with_capacity(self.cfg.replication_factor);
        let mut seen: Vec<&str> = Vec::new();
        for i in 0..tokens.len() {
            let (_, owner) = tokens[(start + i) % tokens.len()];
            if seen.contains(&owner) {
                continue;
            }
            seen.push(owner);

            let instance = &desc.instances[owner];
            if self.is_healthy(instance, now) && instance.state.valid_for(op) {
                replicas.push(instance.clone());
                if replicas.len() == self.cfg.replication_factor {
                    break;
                }
            }
        }

        if replicas.is_empty() {
            return Err(RingError::TooFewHealthy {
                required: 1,
                have: 0,
            });
        }
        Ok(replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, tokens: Vec<u32>, state: InstanceState) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("{id}:0"),
            state,
            tokens,
            last_heartbeat: Instant::now(),
        }
    }

    fn test_ring(rf: usize) -> Ring {
        Ring::new(RingConfig {
            replication_factor: rf,
            heartbeat_timeout: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_get_walks_clockwise_distinct() {
        let ring = test_ring(2);
        ring.register(instance("a", vec![100], InstanceState::Active));
        ring.register(instance("b", vec![200], InstanceState::Active));
        ring.register(instance("c", vec![300], InstanceState::Active));

        let replicas = ring.get(150, Op::Write).unwrap();
        let ids: Vec<_> = replicas.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        // wraps around the token space
        let replicas = ring.get(250, Op::Write).unwrap();
        let ids: Vec<_> = replicas.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_get_is_deterministic() {
        let ring = test_ring(3);
        for (id, token) in [("a", 10u32), ("b", 20), ("c", 30)] {
            ring.register(instance(id, vec![token], InstanceState::Active));
        }
        let first = ring.get(15, Op::Write).unwrap();
        for _ in 0..10 {
            let again = ring.get(15, Op::Write).unwrap();
            assert_eq!(
                first.iter().map(|r| &r.id).collect::<Vec<_>>(),
                again.iter().map(|r| &r.id).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_op_state_filters() {
        let ring = test_ring(3);
        ring.register(instance("active", vec![100], InstanceState::Active));
        ring.register(instance("joining", vec![200], InstanceState::Joining));
        ring.register(instance("leaving", vec![300], InstanceState::Leaving));

        let write: Vec<_> = ring
            .get(0, Op::Write)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(write, vec!["active", "leaving"]);

        let write_no_extend: Vec<_> = ring
            .get(0, Op::WriteNoExtend)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(write_no_extend, vec!["active", "joining", "leaving"]);

        let read: Vec<_> = ring
            .get(0, Op::Read)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(read, vec!["active", "leaving"]);
    }

    #[test]
    fn test_expired_heartbeat_excluded() {
        let ring = Ring::new(RingConfig {
            replication_factor: 2,
            heartbeat_timeout: Duration::from_millis(10),
        });
        let mut stale = instance("stale", vec![100], InstanceState::Active);
        stale.last_heartbeat = Instant::now() - Duration::from_secs(5);
        ring.register(stale);
        ring.register(instance("fresh", vec![200], InstanceState::Active));

        let replicas = ring.get(0, Op::Write).unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].id, "fresh");

        // heartbeat revives it
        ring.heartbeat("stale").unwrap();
        assert_eq!(ring.get(0, Op::Write).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_ring_errors() {
        let ring = test_ring(3);
        assert!(matches!(ring.get(0, Op::Write), Err(RingError::EmptyRing)));
    }
}
