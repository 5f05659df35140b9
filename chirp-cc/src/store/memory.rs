//! In-memory blob store
//!
//! Backs tests and ad-hoc runs. Supports injecting failures so pipeline
//! error paths can be exercised without a broken disk.

use super::{BlobStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, (Vec<u8>, String)>,
    fail_puts: bool,
    fail_gets: bool,
}

/// Map-backed blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    base_url: String,
    inner: Mutex<Inner>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make subsequent puts fail with a transient error
    pub fn fail_puts(&self, fail: bool) {
        self.inner.lock().fail_puts = fail;
    }

    /// Make subsequent gets fail with a transient error
    pub fn fail_gets(&self, fail: bool) {
        self.inner.lock().fail_gets = fail;
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_puts {
            return Err(StoreError::Transient("injected put failure".to_string()));
        }
        inner
            .blobs
            .entry(key.to_string())
            .or_insert_with(|| (bytes.to_vec(), content_type.to_string()));
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        if inner.fail_gets {
            return Err(StoreError::Transient("injected get failure".to_string()));
        }
        inner
            .blobs
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().blobs.contains_key(key))
    }
}
