// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cache decorator.
//!
//! Wraps a reader/writer pair with a key-value cache keyed by
//! `join(keypath, ":") + ":" + name`. Only calls with `should_cache = true`
//! consult or populate the cache. Durability stays the job of the wrapped
//! writer: a cached write still delegates the bytes down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{AppendTracker, BackendError, KeyPath, RawReader, RawWriter};

/// The key-value store behind the cache decorator. Memcached and redis
/// transports implement this elsewhere; the in-process [`MemoryCache`] covers
/// tests and single-binary deployments.
pub trait KeyValueCache: Send + Sync {
    fn fetch(&self, key: &str) -> Option<Bytes>;
    fn store(&self, key: &str, value: Bytes);
}

/// Bounded in-process cache with FIFO eviction.
pub struct MemoryCache {
    max_items: usize,
    inner: Mutex<MemoryCacheInner>,
}

struct MemoryCacheInner {
    items: HashMap<String, Bytes>,
    order: std::collections::VecDeque<String>,
}

impl MemoryCache {
    pub fn new(max_items: usize) -> Self {
        MemoryCache {
            max_items,
            inner: Mutex::new(MemoryCacheInner {
                items: HashMap::new(),
                order: std::collections::VecDeque::new(),
            }),
        }
    }
}

impl KeyValueCache for MemoryCache {
    fn fetch(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().items.get(key).cloned()
    }

    fn store(&self, key: &str, value: Bytes) {
        let mut inner = self.inner.lock();
        if !inner.items.contains_key(key) {
            inner.order.push_back(key.to_string());
        }
        inner.items.insert(key.to_string(), value);

        while inner.order.len() > self.max_items {
            if let Some(evicted) = inner.order.pop_front() {
                inner.items.remove(&evicted);
            }
        }
    }
}

/// Reader/writer decorator consulting a [`KeyValueCache`].
pub struct CachedBackend {
    next_reader: Arc<dyn RawReader>,
    next_writer: Arc<dyn RawWriter>,
    cache: Arc<dyn KeyValueCache>,
}

impl CachedBackend {
    pub fn new(
        next_reader: Arc<dyn RawReader>,
        next_writer: Arc<dyn RawWriter>,
        cache: Arc<dyn KeyValueCache>,
    ) -> Self {
        CachedBackend {
            next_reader,
            next_writer,
            cache,
        }
    }
}

#[async_trait]
impl RawReader for CachedBackend {
    async fn list(&self, keypath: &KeyPath) -> Result<Vec<String>, BackendError> {
        self.next_reader.list(keypath).await
    }

    async fn read(
        &self,
        name: &str,
        keypath: &KeyPath,
        should_cache: bool,
    ) -> Result<Bytes, BackendError> {
        let key = keypath.cache_key(name);
        if should_cache {
            if let Some(hit) = self.cache.fetch(&key) {
                return Ok(hit);
            }
        }

        let bytes = self.next_reader.read(name, keypath, false).await?;
        if should_cache {
            self.cache.store(&key, bytes.clone());
        }
        Ok(bytes)
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &KeyPath,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), BackendError> {
        self.next_reader.read_range(name, keypath, offset, buffer).await
    }
}

#[async_trait]
impl RawWriter for CachedBackend {
    async fn write(
        &self,
        name: &str,
        keypath: &KeyPath,
        data: Bytes,
        should_cache: bool,
    ) -> Result<(), BackendError> {
        if should_cache {
            self.cache.store(&keypath.cache_key(name), data.clone());
        }
        self.next_writer.write(name, keypath, data, false).await
    }

    async fn append(
        &self,
        name: &str,
        keypath: &KeyPath,
        tracker: Option<AppendTracker>,
        buffer: &[u8],
    ) -> Result<AppendTracker, BackendError> {
        self.next_writer.append(name, keypath, tracker, buffer).await
    }

    async fn close_append(&self, tracker: AppendTracker) -> Result<(), BackendError> {
        self.next_writer.close_append(tracker).await
    }

    async fn delete(&self, name: &str, keypath: &KeyPath) -> Result<(), BackendError> {
        self.next_writer.delete(name, keypath).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use uuid::Uuid;

    fn cached() -> (Arc<MemoryBackend>, CachedBackend, Arc<MemoryCache>) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(MemoryCache::new(16));
        let decorated = CachedBackend::new(backend.clone(), backend.clone(), cache.clone());
        (backend, decorated, cache)
    }

    #[tokio::test]
    async fn test_read_populates_cache_only_when_asked() {
        let (backend, decorated, cache) = cached();
        let kp = KeyPath::from_block("t", Uuid::nil());
        backend.write("bloom-0", &kp, Bytes::from_static(b"bits"), false).await.unwrap();

        decorated.read("bloom-0", &kp, false).await.unwrap();
        assert!(cache.fetch(&kp.cache_key("bloom-0")).is_none());

        decorated.read("bloom-0", &kp, true).await.unwrap();
        assert_eq!(cache.fetch(&kp.cache_key("bloom-0")).unwrap(), Bytes::from_static(b"bits"));
    }

    #[tokio::test]
    async fn test_cached_read_skips_backend() {
        let (backend, decorated, _cache) = cached();
        let kp = KeyPath::from_block("t", Uuid::nil());
        backend.write("bloom-0", &kp, Bytes::from_static(b"v1"), false).await.unwrap();

        decorated.read("bloom-0", &kp, true).await.unwrap();

        // mutate underneath; the cached value must win
        backend.write("bloom-0", &kp, Bytes::from_static(b"v2"), false).await.unwrap();
        let bytes = decorated.read("bloom-0", &kp, true).await.unwrap();
        assert_eq!(&bytes[..], b"v1");
    }

    #[tokio::test]
    async fn test_write_through_stores_and_delegates() {
        let (backend, decorated, cache) = cached();
        let kp = KeyPath::from_block("t", Uuid::nil());

        decorated.write("bloom-1", &kp, Bytes::from_static(b"bits"), true).await.unwrap();
        assert!(cache.fetch(&kp.cache_key("bloom-1")).is_some());
        assert_eq!(&backend.read("bloom-1", &kp, false).await.unwrap()[..], b"bits");
    }

    #[test]
    fn test_memory_cache_eviction() {
        let cache = MemoryCache::new(2);
        cache.store("a", Bytes::from_static(b"1"));
        cache.store("b", Bytes::from_static(b"2"));
        cache.store("c", Bytes::from_static(b"3"));
        assert!(cache.fetch("a").is_none());
        assert!(cache.fetch("b").is_some());
        assert!(cache.fetch("c").is_some());
    }
}
