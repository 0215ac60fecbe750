//! Object storage capability.
//!
//! The engine treats remote storage as a blob store with put/get/expire;
//! the embedder supplies the transport. Files are keyed
//! `<instance_id>/<file_id>` inside the bucket.

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Error, Result};

pub fn blob_key(instance_id: u32, file_id: u64) -> String {
    format!("{instance_id}/{file_id:08}")
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: String, data: Bytes) -> Result<()>;
    async fn get(&self, key: String) -> Result<Bytes>;
    /// Mark a blob for lifecycle deletion.
    fn set_expired(&self, key: String);
}

/// In-memory blob store used by tests and single-node deployments without
/// object storage credentials.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: DashMap<String, Bytes>,
    expired: DashMap<String, ()>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn is_expired(&self, key: &str) -> bool {
        self.expired.contains_key(key)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, key: String, data: Bytes) -> Result<()> {
        self.blobs.insert(key, data);
        Ok(())
    }

    async fn get(&self, key: String) -> Result<Bytes> {
        self.blobs
            .get(&key)
            .map(|v| v.clone())
            .ok_or_else(|| Error::Io(format!("blob not found: {key}")))
    }

    fn set_expired(&self, key: String) {
        self.expired.insert(key, ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_expire() {
        let store = MemBlobStore::new();
        let key = blob_key(3, 17);
        assert_eq!(key, "3/00000017");

        store
            .put(key.clone(), Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(store.get(key.clone()).await.unwrap(), &b"data"[..]);

        store.set_expired(key.clone());
        assert!(store.is_expired(&key));
        assert!(store.get("3/00000099".into()).await.is_err());
    }
}
