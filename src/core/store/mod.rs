pub mod keys;

use std::{future::Future, sync::Arc};

use anyhow::Context;
use bytes::Bytes;
use object_store::{ObjectStore, memory::InMemory, path::Path};
use url::Url;

use crate::core::StoreError;

pub use keys::{AnnotatedKey, OriginalKey};

/// Put/get of image bytes by key.
pub trait ArtifactStore: Send + Sync + 'static {
    fn put(&self, key: &str, bytes: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send;
    fn get(&self, key: &str) -> impl Future<Output = Result<Bytes, StoreError>> + Send;
}

/// [`ArtifactStore`] backed by any `object_store` backend (S3, local
/// filesystem, memory). Keys are placed below an optional prefix.
#[derive(Debug, Clone)]
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default())
    }

    /// Build from a store URL such as `s3://bucket/prefix`, `file:///srv/images`
    /// or `memory://`. S3 credentials and region come from the usual AWS
    /// environment variables.
    pub fn from_url(url: &Url) -> anyhow::Result<Self> {
        let (store, prefix) = object_store::parse_url(url)
            .with_context(|| format!("Unsupported artifact store URL {url}"))?;
        Ok(Self::new(Arc::from(store), prefix))
    }

    fn location(&self, key: &str) -> Path {
        let key = Path::from(key);
        self.prefix.parts().chain(key.parts()).collect()
    }
}

impl ArtifactStore for ObjectArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let location = self.location(key);
        self.store
            .put(&location, bytes.into())
            .await
            .map_err(|err| StoreError::backend(key, err))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let location = self.location(key);
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(StoreError::backend(key, err)),
        };
        result
            .bytes()
            .await
            .map_err(|err| StoreError::backend(key, err))
    }
}
