use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{
    path::Path as ObjPath, Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore,
    PutOptions, PutPayload,
};

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};
use crate::utils::timeouts::{bounded, CallClass};

pub type DynStore = Arc<dyn ObjectStore>;

pub const DEFAULT_BLOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Content type and user metadata stored alongside a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobAttributes {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl BlobAttributes {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn into_object_attributes(self) -> Attributes {
        let mut attributes = Attributes::new();
        if let Some(content_type) = self.content_type {
            attributes.insert(Attribute::ContentType, AttributeValue::from(content_type));
        }
        for (key, value) in self.metadata {
            attributes.insert(Attribute::Metadata(key.into()), AttributeValue::from(value));
        }
        attributes
    }
}

/// Blob store shared by every component. All calls are bounded by the blob
/// deadline.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    op_timeout: Duration,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration.
    pub async fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        let backend_kind = cfg.storage.clone();
        let store = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            op_timeout: Duration::from_secs(cfg.blob_timeout_secs),
        })
    }

    /// Create a StorageManager with a custom storage backend.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            op_timeout: DEFAULT_BLOB_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// In-memory backend, isolated per instance.
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    // The local filesystem backend rejects attribute writes.
    fn supports_attributes(&self) -> bool {
        !matches!(self.backend_kind, StorageKind::Local)
    }

    /// Store bytes at the specified location, overwriting any existing object.
    pub async fn put(
        &self,
        location: &str,
        data: Bytes,
        attributes: BlobAttributes,
    ) -> Result<(), AppError> {
        let path = ObjPath::from(location);
        let payload = PutPayload::from_bytes(data);
        let opts = if self.supports_attributes() {
            PutOptions {
                attributes: attributes.into_object_attributes(),
                ..Default::default()
            }
        } else {
            PutOptions::default()
        };

        bounded(
            self.op_timeout,
            CallClass::Blob,
            "blob_put",
            self.store.put_opts(&path, payload, opts),
        )
        .await
        .map(|_| ())
    }

    /// Retrieve bytes from the specified location.
    pub async fn get(&self, location: &str) -> Result<Bytes, AppError> {
        let path = ObjPath::from(location);
        bounded(self.op_timeout, CallClass::Blob, "blob_get", async {
            self.store.get(&path).await?.bytes().await
        })
        .await
    }

    /// Server-side copy; overwrites the destination.
    pub async fn copy(&self, from: &str, to: &str) -> Result<(), AppError> {
        let from = ObjPath::from(from);
        let to = ObjPath::from(to);
        bounded(
            self.op_timeout,
            CallClass::Blob,
            "blob_copy",
            self.store.copy(&from, &to),
        )
        .await
    }

    /// Delete a single object. Deleting a missing object succeeds.
    pub async fn delete(&self, location: &str) -> Result<(), AppError> {
        let path = ObjPath::from(location);
        bounded(self.op_timeout, CallClass::Blob, "blob_delete", async {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// List all objects below the specified prefix.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectMeta>, AppError> {
        let prefix_path = prefix.map(ObjPath::from);
        bounded(
            self.op_timeout,
            CallClass::Blob,
            "blob_list",
            self.store.list(prefix_path.as_ref()).try_collect::<Vec<_>>(),
        )
        .await
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> Result<bool, AppError> {
        let path = ObjPath::from(location);
        bounded(self.op_timeout, CallClass::Blob, "blob_head", async {
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
    }
}

/// Create a storage backend based on configuration.
async fn create_storage_backend(cfg: &AppConfig) -> Result<DynStore, AppError> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base)?;
            Ok(Arc::new(store))
        }
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
        StorageKind::S3 => {
            let mut builder =
                AmazonS3Builder::from_env().with_bucket_name(cfg.documents_bucket.clone());
            if let Some(region) = &cfg.s3_region {
                builder = builder.with_region(region.clone());
            }
            if let Some(endpoint) = &cfg.s3_endpoint {
                builder = builder.with_endpoint(endpoint.clone()).with_allow_http(true);
            }
            Ok(Arc::new(builder.build()?))
        }
    }
}

fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    let base = PathBuf::from(&cfg.data_dir);
    if base.is_absolute() {
        base
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&base))
            .unwrap_or(base)
    }
}
