// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request hedging for reads.
//!
//! If the first attempt has not returned within `hedge_at`, a second attempt
//! is issued in parallel and the first to succeed wins; the loser is dropped.
//! A failed read returns only after both attempts have failed. Writes and
//! lists are never hedged, and at most one extra request is ever in flight
//! per call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use crate::{BackendError, KeyPath, RawReader};

pub struct HedgedReader {
    inner: Arc<dyn RawReader>,
    hedge_at: Duration,
}

impl HedgedReader {
    pub fn new(inner: Arc<dyn RawReader>, hedge_at: Duration) -> Self {
        HedgedReader { inner, hedge_at }
    }

    async fn hedge<T, F, Fut>(&self, make: F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let first = make();
        tokio::pin!(first);

        // Phase one: only the first attempt is in flight.
        let first_result = tokio::select! {
            res = &mut first => Some(res),
            () = sleep(self.hedge_at) => None,
        };

        match first_result {
            Some(Ok(v)) => return Ok(v),
            // First attempt failed fast: the hedge becomes a plain retry.
            Some(Err(first_err)) => {
                return match make().await {
                    Ok(v) => Ok(v),
                    Err(_) => Err(first_err),
                };
            }
            None => {}
        }

        // Phase two: both attempts in flight, first success wins.
        let second = make();
        tokio::pin!(second);

        let mut first_err: Option<BackendError> = None;
        let mut second_err: Option<BackendError> = None;
        loop {
            tokio::select! {
                res = &mut first, if first_err.is_none() => match res {
                    Ok(v) => return Ok(v),
                    Err(e) => {
                        if second_err.is_some() {
                            return Err(e);
                        }
                        first_err = Some(e);
                    }
                },
                res = &mut second, if second_err.is_none() => match res {
                    Ok(v) => return Ok(v),
                    Err(e) => {
                        if let Some(e1) = first_err.take() {
                            return Err(e1);
                        }
                        second_err = Some(e);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl RawReader for HedgedReader {
    async fn list(&self, keypath: &KeyPath) -> Result<Vec<String>, BackendError> {
        self.inner.list(keypath).await
    }

    async fn read(
        &self,
        name: &str,
        keypath: &KeyPath,
        should_cache: bool,
    ) -> Result<Bytes, BackendError> {
        if self.hedge_at.is_zero() {
            return self.inner.read(name, keypath, should_cache).await;
        }

        let inner = self.inner.clone();
        let name = name.to_string();
        let keypath = keypath.clone();
        self.hedge(|| {
            let inner = inner.clone();
            let name = name.clone();
            let keypath = keypath.clone();
            async move { inner.read(&name, &keypath, should_cache).await }
        })
        .await
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &KeyPath,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), BackendError> {
        if self.hedge_at.is_zero() {
            return self.inner.read_range(name, keypath, offset, buffer).await;
        }

        // Two attempts cannot share the caller's buffer, so each races into
        // its own and the winner is copied out.
        let inner = self.inner.clone();
        let name = name.to_string();
        let keypath = keypath.clone();
        let len = buffer.len();
        let winner = self
            .hedge(|| {
                let inner = inner.clone();
                let name = name.clone();
                let keypath = keypath.clone();
                async move {
                    let mut buf = vec![0u8; len];
                    inner.read_range(&name, &keypath, offset, &mut buf).await?;
                    Ok(buf)
                }
            })
            .await?;

        buffer.copy_from_slice(&winner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reader whose per-call behavior is scripted: a delay and a result.
    struct ScriptedReader {
        calls: AtomicUsize,
        script: Mutex<Vec<(Duration, Result<Bytes, ()>)>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<(Duration, Result<Bytes, ()>)>) -> Self {
            ScriptedReader {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RawReader for ScriptedReader {
        async fn list(&self, _keypath: &KeyPath) -> Result<Vec<String>, BackendError> {
            Ok(Vec::new())
        }

        async fn read(
            &self,
            _name: &str,
            _keypath: &KeyPath,
            _should_cache: bool,
        ) -> Result<Bytes, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, result) = self.script.lock().remove(0);
            sleep(delay).await;
            result.map_err(|()| BackendError::Other("scripted failure".to_string()))
        }

        async fn read_range(
            &self,
            _name: &str,
            _keypath: &KeyPath,
            _offset: u64,
            _buffer: &mut [u8],
        ) -> Result<(), BackendError> {
            unimplemented!("not used in these tests")
        }
    }

    fn kp() -> KeyPath {
        KeyPath::from_tenant("t")
    }

    #[tokio::test]
    async fn test_fast_first_attempt_never_hedges() {
        let inner = Arc::new(ScriptedReader::new(vec![(
            Duration::from_millis(1),
            Ok(Bytes::from_static(b"fast")),
        )]));
        let hedged = HedgedReader::new(inner.clone(), Duration::from_millis(100));

        let bytes = hedged.read("o", &kp(), false).await.unwrap();
        assert_eq!(&bytes[..], b"fast");
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_first_attempt_hedges_and_second_wins() {
        let inner = Arc::new(ScriptedReader::new(vec![
            (Duration::from_secs(60), Ok(Bytes::from_static(b"slow"))),
            (Duration::from_millis(1), Ok(Bytes::from_static(b"hedge"))),
        ]));
        let hedged = HedgedReader::new(inner.clone(), Duration::from_millis(50));

        let bytes = hedged.read("o", &kp(), false).await.unwrap();
        assert_eq!(&bytes[..], b"hedge");
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_only_after_both_attempts_fail() {
        let inner = Arc::new(ScriptedReader::new(vec![
            (Duration::from_millis(200), Err(())),
            (Duration::from_millis(200), Err(())),
        ]));
        let hedged = HedgedReader::new(inner.clone(), Duration::from_millis(50));

        let err = hedged.read("o", &kp(), false).await.unwrap_err();
        assert!(matches!(err, BackendError::Other(_)));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_survives_first_attempt_failure() {
        let inner = Arc::new(ScriptedReader::new(vec![
            (Duration::from_millis(200), Err(())),
            (Duration::from_millis(200), Ok(Bytes::from_static(b"ok"))),
        ]));
        let hedged = HedgedReader::new(inner.clone(), Duration::from_millis(50));

        let bytes = hedged.read("o", &kp(), false).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_zero_hedge_disables() {
        let inner = Arc::new(ScriptedReader::new(vec![(
            Duration::from_millis(1),
            Ok(Bytes::from_static(b"x")),
        )]));
        let hedged = HedgedReader::new(inner.clone(), Duration::ZERO);
        hedged.read("o", &kp(), false).await.unwrap();
        assert_eq!(inner.calls(), 1);
    }
}
