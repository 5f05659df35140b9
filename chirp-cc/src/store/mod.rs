//! Blob stores
//!
//! Two narrow key-value surfaces: the clip store (content-addressed by
//! SHA-256 of the bytes) and the asset store (keyed by species code).
//! Putting the same key twice is idempotent by construction.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Blob store errors, split so callers can decide whether to retry
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O; the operation may succeed if repeated
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Permanent condition (quota, permissions, invalid key)
    #[error("Permanent store error: {0}")]
    Permanent(String),

    /// Key has no stored blob
    #[error("Blob not found: {0}")]
    NotFound(String),
}

/// Opaque blob storage keyed by caller-chosen strings
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `key`, returning the public URL
    ///
    /// Re-putting an existing key is a success and returns the same URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<String, StoreError>;

    /// Fetch the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Whether `key` has a stored blob
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// SHA-256 content key for clip bytes, lowercase hex
pub fn content_key(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// File extension for a declared content type (clip audio or generated art)
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        "audio/flac" => "flac",
        "audio/ogg" => "ogg",
        "image/webp" => "webp",
        "image/png" => "png",
        "image/gif" => "gif",
        _ => "bin",
    }
}
