// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend, used by tests and the single-binary dev mode.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{AppendTracker, BackendError, KeyPath, RawReader, RawWriter};

#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
    appends: RwLock<HashMap<u64, (String, Vec<u8>)>>,
    next_tracker: std::sync::atomic::AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_path(name: &str, keypath: &KeyPath) -> String {
        let mut p = keypath.0.join("/");
        if !p.is_empty() {
            p.push('/');
        }
        p.push_str(name);
        p
    }

    /// Number of stored objects, handy in tests.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl RawReader for MemoryBackend {
    async fn list(&self, keypath: &KeyPath) -> Result<Vec<String>, BackendError> {
        let prefix = if keypath.0.is_empty() {
            String::new()
        } else {
            format!("{}/", keypath.0.join("/"))
        };

        let objects = self.objects.read();
        let mut children: Vec<String> = objects
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(i) => rest[..i].to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.sort();
        children.dedup();

        if children.is_empty() {
            return Err(BackendError::DoesNotExist);
        }
        Ok(children)
    }

    async fn read(
        &self,
        name: &str,
        keypath: &KeyPath,
        _should_cache: bool,
    ) -> Result<Bytes, BackendError> {
        self.objects
            .read()
            .get(&Self::full_path(name, keypath))
            .cloned()
            .ok_or(BackendError::DoesNotExist)
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &KeyPath,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), BackendError> {
        let objects = self.objects.read();
        let bytes = objects
            .get(&Self::full_path(name, keypath))
            .ok_or(BackendError::DoesNotExist)?;

        let start = offset as usize;
        let end = start + buffer.len();
        if end > bytes.len() {
            return Err(BackendError::Other(format!(
                "range read past end of object: {end} > {}",
                bytes.len()
            )));
        }
        buffer.copy_from_slice(&bytes[start..end]);
        Ok(())
    }
}

#[async_trait]
impl RawWriter for MemoryBackend {
    async fn write(
        &self,
        name: &str,
        keypath: &KeyPath,
        data: Bytes,
        _should_cache: bool,
    ) -> Result<(), BackendError> {
        self.objects
            .write()
            .insert(Self::full_path(name, keypath), data);
        Ok(())
    }

    async fn append(
        &self,
        name: &str,
        keypath: &KeyPath,
        tracker: Option<AppendTracker>,
        buffer: &[u8],
    ) -> Result<AppendTracker, BackendError> {
        let tracker = match tracker {
            Some(t) => t,
            None => {
                let id = self
                    .next_tracker
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.appends
                    .write()
                    .insert(id, (Self::full_path(name, keypath), Vec::new()));
                AppendTracker(id)
            }
        };

        let mut appends = self.appends.write();
        let (_, buf) = appends
            .get_mut(&tracker.0)
            .ok_or_else(|| BackendError::Other("unknown append tracker".to_string()))?;
        buf.extend_from_slice(buffer);
        Ok(tracker)
    }

    async fn close_append(&self, tracker: AppendTracker) -> Result<(), BackendError> {
        let (path, buf) = self
            .appends
            .write()
            .remove(&tracker.0)
            .ok_or_else(|| BackendError::Other("unknown append tracker".to_string()))?;
        self.objects.write().insert(path, Bytes::from(buf));
        Ok(())
    }

    async fn delete(&self, name: &str, keypath: &KeyPath) -> Result<(), BackendError> {
        self.objects.write().remove(&Self::full_path(name, keypath));
        Ok(())
    }
}
