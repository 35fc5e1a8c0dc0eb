use async_trait::async_trait;
use bytes::Bytes;
use common::Result;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

/// Byte-level access to one storage root. Keys are relative to the root.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &Path, data: Vec<u8>) -> Result<()>;
    async fn get_object(&self, key: &Path) -> Result<Bytes>;
    /// Every object below `prefix`, sorted by key.
    async fn list_objects(&self, prefix: &Path) -> Result<Vec<Path>>;
    async fn delete_object(&self, key: &Path) -> Result<()>;
    async fn rename_object(&self, from: &Path, to: &Path) -> Result<()>;
    async fn check_file_exists(&self, key: &Path) -> Result<bool>;
    /// Human readable location of the root, for logs.
    fn root(&self) -> &str;
}

/// [`ObjectStorage`] over any `object_store` backend: local filesystem,
/// S3, or in-memory.
pub struct ObjectStoreStorage {
    root: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(root: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            root: root.to_string(),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new("memory://", Arc::new(object_store::memory::InMemory::new()))
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn put_object(&self, key: &Path, data: Vec<u8>) -> Result<()> {
        self.store.put(key, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn get_object(&self, key: &Path) -> Result<Bytes> {
        let response = self.store.get(key).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => common::Error::Storage(format!(
                "Object {} not found under {}",
                key, self.root
            )),
            other => other.into(),
        })?;

        Ok(response.bytes().await?)
    }

    async fn list_objects(&self, prefix: &Path) -> Result<Vec<Path>> {
        let prefix = if prefix.as_ref().is_empty() {
            None
        } else {
            Some(prefix)
        };

        let mut objects: Vec<Path> = self
            .store
            .list(prefix)
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        objects.sort();

        Ok(objects)
    }

    async fn delete_object(&self, key: &Path) -> Result<()> {
        match self.store.delete(key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy then delete. A local store with automatic cleanup also drops
    /// the source directories this empties, which a plain rename leaves.
    async fn rename_object(&self, from: &Path, to: &Path) -> Result<()> {
        self.store.copy(from, to).await?;
        self.store.delete(from).await?;
        Ok(())
    }

    async fn check_file_exists(&self, key: &Path) -> Result<bool> {
        match self.store.head(key).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn root(&self) -> &str {
        &self.root
    }
}
