//! Object store capability for the cloud realization.
//!
//! The trait exists so the upload/retry path can be exercised with a
//! mock; the production implementation is S3 (or any S3-compatible
//! endpoint such as MinIO or R2).

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("S3 SDK error: {0}")]
    Sdk(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// S3 connection settings.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible services; None means AWS.
    pub endpoint_url: Option<String>,
}

/// Upload-only view of an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one object and return its durable public URL.
    async fn upload(
        &self,
        key: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<String, ObjectStoreError>;

    /// Cheap liveness probe for the health endpoint.
    async fn check(&self) -> Result<(), ObjectStoreError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    /// Base for returned URLs: the custom endpoint or the AWS
    /// virtual-host form.
    public_base: String,
}

impl S3ObjectStore {
    /// Build a client and verify the bucket is reachable. A bucket that
    /// cannot be reached here means the cloud configuration is unusable,
    /// which the caller treats as fatal.
    pub async fn connect(config: S3Config) -> Result<Self, ObjectStoreError> {
        if config.bucket.trim().is_empty() {
            return Err(ObjectStoreError::Config(
                "Bucket name cannot be empty".to_string(),
            ));
        }

        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "slowpost-s3-config",
        );
        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            let normalized = endpoint.trim_end_matches('/').to_string();
            info!("Using custom S3 endpoint: {}", normalized);
            builder = builder.endpoint_url(normalized);
        }
        let aws_config = builder.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        let public_base = match &config.endpoint_url {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
            None => format!(
                "https://{}.s3.{}.amazonaws.com",
                config.bucket, config.region
            ),
        };

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .map_err(|e| {
                ObjectStoreError::Sdk(format!("Bucket '{}' not reachable: {}", config.bucket, e))
            })?;
        info!("Object store ready (bucket: {})", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
            public_base,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(
        &self,
        key: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<String, ObjectStoreError> {
        debug!("Uploading {} ({} bytes)", key, data.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.to_vec().into())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Sdk(format!("Put object failed: {}", e)))?;

        let url = format!("{}/{}", self.public_base, key);
        debug!("Successfully uploaded to {}", url);
        Ok(url)
    }

    async fn check(&self) -> Result<(), ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Sdk(format!("Head bucket failed: {}", e)))?;
        Ok(())
    }
}
