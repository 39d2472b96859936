//! Runtime configuration.
//!
//! One immutable value constructed at startup and passed into the
//! service and store constructors. The storage realization is decided
//! here, once: cloud only when the complete credential set is present,
//! local otherwise. There is no per-request fallback between the two.

use tracing::warn;

use crate::store::{S3Config, StorageMode};

/// Ceiling for a single uploaded asset (10 MiB).
pub const DEFAULT_MAX_ASSET_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGES: usize = 10;
pub const DEFAULT_MAX_VIDEOS: usize = 3;

/// Per-create upload caps, enforced by the letter service.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_images: usize,
    pub max_videos: usize,
    pub max_asset_bytes: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            max_videos: DEFAULT_MAX_VIDEOS,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
        }
    }
}

/// Credentials for the cloud realization. All present or the set is
/// ignored; only the custom endpoint is optional.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub database_url: String,
    pub s3: S3Config,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub limits: UploadLimits,
    pub cloud: Option<CloudConfig>,
}

impl Config {
    /// Read configuration from the environment (`SLOWPOST_*`).
    pub fn from_env() -> Self {
        let limits = UploadLimits {
            max_images: env_parse("SLOWPOST_MAX_IMAGES", DEFAULT_MAX_IMAGES),
            max_videos: env_parse("SLOWPOST_MAX_VIDEOS", DEFAULT_MAX_VIDEOS),
            max_asset_bytes: env_parse("SLOWPOST_MAX_ASSET_BYTES", DEFAULT_MAX_ASSET_BYTES),
        };
        let cloud = cloud_from_values(
            env_value("SLOWPOST_DATABASE_URL"),
            env_value("SLOWPOST_S3_BUCKET"),
            env_value("SLOWPOST_S3_REGION"),
            env_value("SLOWPOST_S3_ACCESS_KEY"),
            env_value("SLOWPOST_S3_SECRET_KEY"),
            env_value("SLOWPOST_S3_ENDPOINT"),
        );
        Self { limits, cloud }
    }

    pub fn storage_mode(&self) -> StorageMode {
        if self.cloud.is_some() {
            StorageMode::Cloud
        } else {
            StorageMode::Local
        }
    }
}

/// Cloud mode requires the complete credential set. A partial set is
/// treated as absent and logged so the operator can tell a typo from an
/// intentional local deployment.
fn cloud_from_values(
    database_url: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    endpoint_url: Option<String>,
) -> Option<CloudConfig> {
    let provided = [
        database_url.is_some(),
        bucket.is_some(),
        region.is_some(),
        access_key_id.is_some(),
        secret_access_key.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    match (database_url, bucket, region, access_key_id, secret_access_key) {
        (Some(database_url), Some(bucket), Some(region), Some(access_key_id), Some(secret_access_key)) => {
            Some(CloudConfig {
                database_url,
                s3: S3Config {
                    bucket,
                    region,
                    access_key_id,
                    secret_access_key,
                    endpoint_url,
                },
            })
        }
        _ => {
            if provided > 0 {
                warn!(
                    "Partial cloud configuration ({provided}/5 values); falling back to local storage"
                );
            }
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
