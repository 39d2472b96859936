//! Storage backend abstraction.
//!
//! Two interchangeable realizations behind one trait: a local JSON file
//! plus an upload directory, and a Postgres table plus an S3-compatible
//! object store. The application selects exactly one at startup (see
//! `config`); a configured cloud store that fails at runtime surfaces
//! the failure rather than silently diverting writes to local disk.

pub mod cloud;
pub mod local;
pub mod object;

pub use cloud::CloudStore;
pub use local::LocalStore;
pub use object::{ObjectStore, ObjectStoreError, S3Config, S3ObjectStore};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::Letter;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Letters file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

/// Which storage realization is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Local,
    Cloud,
}

/// One uploaded file, buffered in memory by the multipart layer.
#[derive(Debug, Clone)]
pub struct UploadedAsset {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Media for a single create, already partitioned by MIME prefix.
#[derive(Debug, Clone, Default)]
pub struct MediaBundle {
    pub images: Vec<UploadedAsset>,
    pub videos: Vec<UploadedAsset>,
    pub audio: Option<UploadedAsset>,
}

/// Durable locations for a persisted bundle, in sender-chosen order.
#[derive(Debug, Clone, Default)]
pub struct AssetUrls {
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub audio_url: Option<String>,
}

/// Live backend state for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub mode: StorageMode,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait LetterStore: Send + Sync {
    /// Persist a create's media and return their durable locations.
    async fn put_assets(&self, media: MediaBundle) -> Result<AssetUrls, StoreError>;

    /// Append a newly created letter.
    async fn create(&self, letter: &Letter) -> Result<(), StoreError>;

    async fn get_all(&self) -> Result<Vec<Letter>, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Letter>, StoreError>;

    /// Overwrite only the pending-editable fields. Returns false when the
    /// letter does not exist. The service enforces the reveal/password
    /// gate before calling this.
    async fn update_pending(
        &self,
        id: &str,
        letter_content: &str,
        delay_minutes: i64,
    ) -> Result<bool, StoreError>;

    /// Live backend check for the health endpoint. Never mutates.
    async fn health(&self) -> StoreHealth;

    fn mode(&self) -> StorageMode;
}

/// Namespaced storage name for an uploaded asset: `<unix-millis>-<name>`.
///
/// The original filename is reduced to a safe charset (alphanumerics,
/// dot, dash, underscore); a name with nothing left falls back to a
/// random id. The millisecond prefix keeps repeated filenames from
/// colliding.
pub(crate) fn asset_storage_name(original: &str, now_millis: i64) -> String {
    let base = std::path::Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.chars().all(|c| matches!(c, '.' | '-' | '_')) {
        format!("{}-{}", now_millis, uuid::Uuid::new_v4())
    } else {
        format!("{}-{}", now_millis, safe)
    }
}
