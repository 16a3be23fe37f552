// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem backend.
//!
//! Objects live at `<root>/<keypath...>/<name>`. Writes go through a
//! temporary file in the same directory followed by a rename, so readers
//! only ever observe complete objects. File IO here is blocking; callers
//! keep objects small or run on the blocking-tolerant flush paths.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{AppendTracker, BackendError, KeyPath, RawReader, RawWriter};

pub struct LocalBackend {
    root: PathBuf,
    appends: Mutex<HashMap<u64, File>>,
    next_tracker: AtomicU64,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalBackend {
            root,
            appends: Mutex::new(HashMap::new()),
            next_tracker: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn dir(&self, keypath: &KeyPath) -> PathBuf {
        let mut p = self.root.clone();
        for segment in &keypath.0 {
            p.push(segment);
        }
        p
    }

    fn object_path(&self, name: &str, keypath: &KeyPath) -> PathBuf {
        self.dir(keypath).join(name)
    }

    fn map_not_found(e: std::io::Error) -> BackendError {
        if e.kind() == ErrorKind::NotFound {
            BackendError::DoesNotExist
        } else {
            BackendError::Io(e)
        }
    }
}

#[async_trait]
impl RawReader for LocalBackend {
    async fn list(&self, keypath: &KeyPath) -> Result<Vec<String>, BackendError> {
        let dir = self.dir(keypath);
        let entries = fs::read_dir(&dir).map_err(Self::map_not_found)?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn read(
        &self,
        name: &str,
        keypath: &KeyPath,
        _should_cache: bool,
    ) -> Result<Bytes, BackendError> {
        let bytes = fs::read(self.object_path(name, keypath)).map_err(Self::map_not_found)?;
        Ok(Bytes::from(bytes))
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &KeyPath,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), BackendError> {
        let mut f = File::open(self.object_path(name, keypath)).map_err(Self::map_not_found)?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buffer)?;
        Ok(())
    }
}

#[async_trait]
impl RawWriter for LocalBackend {
    async fn write(
        &self,
        name: &str,
        keypath: &KeyPath,
        data: Bytes,
        _should_cache: bool,
    ) -> Result<(), BackendError> {
        let dir = self.dir(keypath);
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(name);
        let tmp_path = dir.join(format!(".tmp-{name}"));

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &final_path)?;
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
                let dir = self.dir(keypath);
                fs::create_dir_all(&dir)?;
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(dir.join(name))?;
                let id = self.next_tracker.fetch_add(1, Ordering::Relaxed);
                self.appends.lock().insert(id, file);
                AppendTracker(id)
            }
        };

        let mut appends = self.appends.lock();
        let file = appends
            .get_mut(&tracker.0)
            .ok_or_else(|| BackendError::Other("unknown append tracker".to_string()))?;
        file.write_all(buffer)?;
        Ok(tracker)
    }

    async fn close_append(&self, tracker: AppendTracker) -> Result<(), BackendError> {
        let file = self
            .appends
            .lock()
            .remove(&tracker.0)
            .ok_or_else(|| BackendError::Other("unknown append tracker".to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    async fn delete(&self, name: &str, keypath: &KeyPath) -> Result<(), BackendError> {
        match fs::remove_file(self.object_path(name, keypath)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}
