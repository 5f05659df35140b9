//! Filesystem blob store
//!
//! Clips land under `<root>/<first-2-hex>/<key>.<ext>` so a directory
//! never accumulates the whole collection; assets use flat
//! `<root>/<key>.<ext>` paths since species codes are few. Writes go
//! through a temp file and rename so readers never observe a partial
//! blob.

use super::{extension_for, BlobStore, StoreError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Blob store over a local directory tree
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
    sharded: bool,
}

impl FsBlobStore {
    /// Sharded layout for content-hash keys (the clip store)
    pub fn sharded(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            sharded: true,
        }
    }

    /// Flat layout for species-code keys (the asset store)
    pub fn flat(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            sharded: false,
        }
    }

    fn relative_path(&self, key: &str, ext: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains(['/', '\\', '.']) {
            return Err(StoreError::Permanent(format!("invalid blob key: {}", key)));
        }
        let file = format!("{}.{}", key, ext);
        if self.sharded && key.len() >= 2 {
            Ok(PathBuf::from(&key[..2]).join(file))
        } else {
            Ok(PathBuf::from(file))
        }
    }

    /// Locate an existing blob for `key` regardless of its extension
    async fn find_existing(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        let dir = if self.sharded && key.len() >= 2 {
            self.root.join(&key[..2])
        } else {
            self.root.clone()
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(map_io(e)),
        };

        let prefix = format!("{}.", key);
        while let Some(entry) = entries.next_entry().await.map_err(map_io)? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    return Ok(Some(entry.path()));
                }
            }
        }
        Ok(None)
    }

    fn url_for(&self, relative: &Path) -> String {
        let tail = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url.trim_end_matches('/'), tail)
    }
}

fn map_io(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::StorageFull | ErrorKind::PermissionDenied => {
            StoreError::Permanent(e.to_string())
        }
        _ => StoreError::Transient(e.to_string()),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        let relative = self.relative_path(key, extension_for(content_type))?;
        let path = self.root.join(&relative);

        // Content-addressed keys make a re-put a no-op.
        if let Some(existing) = self.find_existing(key).await? {
            let relative = existing
                .strip_prefix(&self.root)
                .map_err(|_| StoreError::Permanent("blob outside store root".to_string()))?;
            return Ok(self.url_for(relative));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_io)?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(map_io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(map_io)?;

        tracing::debug!(key, bytes = bytes.len(), path = %path.display(), "Stored blob");
        Ok(self.url_for(&relative))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self.find_existing(key).await? {
            Some(path) => tokio::fs::read(&path).await.map_err(map_io),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.find_existing(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::content_key;

    #[tokio::test]
    async fn test_put_get_round_trip_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::sharded(dir.path(), "http://localhost/clips");

        let bytes = b"RIFF....WAVEfmt fake clip";
        let key = content_key(bytes);
        let url = store.put(&key, bytes, "audio/wav").await.unwrap();

        assert!(url.starts_with("http://localhost/clips/"));
        assert!(url.contains(&format!("{}/{}", &key[..2], key)));
        assert!(url.ends_with(".wav"));
        assert_eq!(store.get(&key).await.unwrap(), bytes);
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::sharded(dir.path(), "http://localhost/clips");

        let bytes = b"same clip";
        let key = content_key(bytes);
        let url1 = store.put(&key, bytes, "audio/wav").await.unwrap();
        let url2 = store.put(&key, bytes, "audio/wav").await.unwrap();
        assert_eq!(url1, url2);
    }

    #[tokio::test]
    async fn test_flat_layout_for_assets() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::flat(dir.path(), "http://localhost/assets/");

        let url = store.put("amerob", b"not really webp", "image/webp").await.unwrap();
        assert_eq!(url, "http://localhost/assets/amerob.webp");
        assert!(store.exists("amerob").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::sharded(dir.path(), "http://localhost/clips");

        assert!(!store.exists("ab00").await.unwrap());
        assert!(matches!(
            store.get("ab00").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_escape_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::flat(dir.path(), "http://localhost/assets");
        assert!(matches!(
            store.put("../evil", b"x", "audio/wav").await.unwrap_err(),
            StoreError::Permanent(_)
        ));
    }
}
