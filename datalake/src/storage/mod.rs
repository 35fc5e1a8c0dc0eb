pub mod object;

pub use object::{ObjectStorage, ObjectStoreStorage};

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use common::config::StorageSettings;
use common::{Error, Result};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::prefix::PrefixStore;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Where a configured root URI points.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageLocation {
    S3 { bucket: String, prefix: String },
    Local { path: std::path::PathBuf },
}

impl StorageLocation {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(StorageLocation::Local { path: uri.into() });
            }
            Err(e) => return Err(e.into()),
        };

        match url.scheme() {
            "s3" | "s3a" => {
                let bucket = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| Error::InvalidUri(format!("Missing bucket in '{}'", uri)))?;
                Ok(StorageLocation::S3 {
                    bucket: bucket.to_string(),
                    prefix: url.path().trim_matches('/').to_string(),
                })
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::InvalidUri(format!("Not a local file path: '{}'", uri)))?;
                Ok(StorageLocation::Local { path })
            }
            other => Err(Error::InvalidUri(format!(
                "Unsupported scheme '{}' in '{}'",
                other, uri
            ))),
        }
    }
}

/// Builds and caches storage handles for the configured input and output
/// roots.
#[derive(Clone)]
pub struct StorageManager {
    pub config: StorageSettings,
    client_cache: Arc<dashmap::DashMap<String, Arc<S3Client>>>,
    object_store_cache: Arc<dashmap::DashMap<String, Arc<dyn ObjectStore>>>,
}

impl StorageManager {
    pub fn new(config: StorageSettings) -> Self {
        Self {
            config,
            client_cache: Arc::new(dashmap::DashMap::new()),
            object_store_cache: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Opens the root named by `uri`. Local roots are created when missing.
    pub fn storage_for(&self, uri: &str) -> Result<Arc<dyn ObjectStorage>> {
        let store: Arc<dyn ObjectStore> = match StorageLocation::parse(uri)? {
            StorageLocation::S3 { bucket, prefix } => {
                let bucket_store = self.get_object_store(&bucket)?;
                if prefix.is_empty() {
                    bucket_store
                } else {
                    Arc::new(PrefixStore::new(bucket_store, Path::parse(&prefix)?))
                }
            }
            StorageLocation::Local { path } => {
                std::fs::create_dir_all(&path)?;
                Arc::new(LocalFileSystem::new_with_prefix(&path)?.with_automatic_cleanup(true))
            }
        };

        debug!(uri, "Opened storage root");
        Ok(Arc::new(ObjectStoreStorage::new(uri, store)))
    }

    pub fn get_object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.object_store_cache.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&self.config.region)
            .with_allow_http(self.config.allow_http);

        if !self.config.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&self.config.access_key_id)
                .with_secret_access_key(&self.config.secret_key);
        }
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        self.object_store_cache
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    pub fn get_client(&self, bucket: &str) -> Arc<S3Client> {
        if let Some(client) = self.client_cache.get(bucket) {
            return client.clone();
        }

        let credentials = Credentials::new(
            &self.config.access_key_id,
            &self.config.secret_key,
            None,
            None,
            "static",
        );

        let mut s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &self.config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }

        let client = Arc::new(aws_sdk_s3::Client::from_conf(s3_config.build()));
        self.client_cache.insert(bucket.to_string(), client.clone());
        client
    }

    /// Verifies that a bucket exists and is accessible
    pub async fn verify_bucket_exists(&self, bucket: &str) -> Result<()> {
        let client = self.get_client(bucket);

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket, "Bucket is accessible");
                Ok(())
            }
            Err(e) => Err(Error::Storage(format!(
                "Cannot access bucket '{}': {}",
                bucket, e
            ))),
        }
    }

    /// Runs the bucket preflight for every S3 root among `uris`.
    pub async fn verify_roots(&self, uris: &[&str]) -> Result<()> {
        for uri in uris {
            if let StorageLocation::S3 { bucket, .. } = StorageLocation::parse(uri)? {
                self.verify_bucket_exists(&bucket).await?;
            }
        }
        Ok(())
    }
}
