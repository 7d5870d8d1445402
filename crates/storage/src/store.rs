//! Content-addressed artifact store.
//!
//! Backed by S3 in production. The in-memory variant serves tests and
//! storage-less local development; keys and semantics are identical.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::constants::ARCHIVE_MIME_TYPE;
use crate::s3::S3Client;

pub enum ArtifactStore {
    S3(S3Client),
    Memory(MemoryStore),
}

impl ArtifactStore {
    pub async fn s3(bucket: String) -> Result<Self> {
        Ok(ArtifactStore::S3(S3Client::new(bucket).await?))
    }

    pub fn in_memory() -> Self {
        warn!("Artifact store running in memory; artifacts will not survive a restart");
        ArtifactStore::Memory(MemoryStore::default())
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        match self {
            ArtifactStore::S3(client) => {
                client.write_binary(data, key, ARCHIVE_MIME_TYPE).await?;
                Ok(())
            }
            ArtifactStore::Memory(store) => store.put(key, data).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self {
            ArtifactStore::S3(client) => Ok(client.read_binary(key).await?.0),
            ArtifactStore::Memory(store) => store.get(key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            ArtifactStore::S3(client) => client.exists(key).await,
            ArtifactStore::Memory(store) => Ok(store.exists(key).await),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object not found: {}", key))
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = ArtifactStore::in_memory();
        let key = "apps/a/versions/v/code.tar.gz";

        assert!(!store.exists(key).await.unwrap());
        store.put(key, b"archive bytes".to_vec()).await.unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn test_memory_store_missing_key_errors() {
        let store = ArtifactStore::in_memory();
        assert!(store.get("nope").await.is_err());
    }
}
