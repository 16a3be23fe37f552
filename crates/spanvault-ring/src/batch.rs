// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The replicated fan-out primitive.
//!
//! Keys are grouped by destination instance so each instance receives one
//! call carrying the indexes of the keys it owns. A key succeeds when at
//! least `floor(R/2) + 1` of its replicas succeed; the batch succeeds only
//! when every key does, otherwise the first per-key failure is surfaced.

use std::collections::HashMap;
use std::future::Future;

use futures::future::join_all;

use crate::ring::{InstanceDesc, Op, Ring};
use crate::RingError;

#[derive(Debug, thiserror::Error)]
pub enum BatchError<E: std::error::Error> {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Remote(E),
}

pub async fn do_batch<E, F, Fut>(
    ring: &Ring,
    op: Op,
    keys: &[u32],
    callback: F,
) -> Result<(), BatchError<E>>
where
    E: std::error::Error + Clone,
    F: Fn(InstanceDesc, Vec<usize>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    if keys.is_empty() {
        return Ok(());
    }

    // replica set and quorum per key; one call per destination instance
    let mut per_key: Vec<(Vec<String>, usize)> = Vec::with_capacity(keys.len());
    let mut per_instance: HashMap<String, (InstanceDesc, Vec<usize>)> = HashMap::new();

    for (i, key) in keys.iter().enumerate() {
        let replicas = ring.get(*key, op)?;
        let quorum = replicas.len() / 2 + 1;
        let ids: Vec<String> = replicas.iter().map(|r| r.id.clone()).collect();
        per_key.push((ids, quorum));

        for replica in replicas {
            per_instance
                .entry(replica.id.clone())
                .or_insert_with(|| (replica, Vec::new()))
                .1
                .push(i);
        }
    }

    let calls = per_instance.into_iter().map(|(id, (desc, indexes))| {
        let fut = callback(desc, indexes);
        async move { (id, fut.await) }
    });
    let results: HashMap<String, Result<(), E>> = join_all(calls).await.into_iter().collect();

    for (replica_ids, quorum) in &per_key {
        let successes = replica_ids
            .iter()
            .filter(|id| matches!(results.get(*id), Some(Ok(()))))
            .count();
        if successes < *quorum {
            let first_err = replica_ids
                .iter()
                .find_map(|id| match results.get(id) {
                    Some(Err(e)) => Some(e.clone()),
                    _ => None,
                })
                .expect("key below quorum must have at least one failed replica");
            return Err(BatchError::Remote(first_err));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{InstanceState, RingConfig};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("push to {0} failed")]
    struct PushError(String);

    fn ring_with(n: usize, rf: usize) -> Ring {
        let ring = Ring::new(RingConfig {
            replication_factor: rf,
            heartbeat_timeout: Duration::from_secs(60),
        });
        for i in 0..n {
            ring.register(InstanceDesc {
                id: format!("ingester-{i}"),
                addr: format!("127.0.0.1:{i}"),
                state: InstanceState::Active,
                tokens: vec![(i as u32 + 1) * 1000],
                last_heartbeat: Instant::now(),
            });
        }
        ring
    }

    #[tokio::test]
    async fn test_all_replicas_receive_their_keys() {
        let ring = ring_with(3, 3);
        let seen: Arc<Mutex<Vec<(String, Vec<usize>)>>> = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        do_batch(&ring, Op::Write, &[1500, 2500], move |desc, indexes| {
            let seen = seen2.clone();
            async move {
                seen.lock().push((desc.id, indexes));
                Ok::<(), PushError>(())
            }
        })
        .await
        .unwrap();

        let calls = seen.lock();
        // RF = instance count, so every instance gets both keys in one call
        assert_eq!(calls.len(), 3);
        for (_, indexes) in calls.iter() {
            let set: HashSet<_> = indexes.iter().collect();
            assert_eq!(set.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_single_failure_within_quorum_is_swallowed() {
        let ring = ring_with(3, 3);

        let result = do_batch(&ring, Op::Write, &[42], |desc, _indexes| async move {
            if desc.id == "ingester-0" {
                Err(PushError(desc.id))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_quorum_loss_surfaces_first_failure() {
        let ring = ring_with(3, 3);

        let result = do_batch(&ring, Op::Write, &[42], |desc, _indexes| async move {
            if desc.id == "ingester-2" {
                Ok(())
            } else {
                Err(PushError(desc.id))
            }
        })
        .await;

        match result {
            Err(BatchError::Remote(PushError(_))) => {}
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_keys_is_noop() {
        let ring = ring_with(1, 1);
        let result = do_batch(&ring, Op::Write, &[], |_desc, _indexes| async move {
            Err::<(), PushError>(PushError("never called".to_string()))
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_quorum_math_rf2() {
        // R=2 -> quorum = 2: one failure loses the key
        let ring = ring_with(2, 2);
        let result = do_batch(&ring, Op::Write, &[42], |desc, _indexes| async move {
            if desc.id == "ingester-0" {
                Err(PushError(desc.id))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_err());
    }
}
