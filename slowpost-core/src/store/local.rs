//! Local storage realization: one JSON array file plus an uploads
//! directory.
//!
//! Every write is a whole-file read-modify-rewrite with no locking, so
//! concurrent writers race and the last one wins. That is a documented
//! limitation, acceptable at single-digit sender concurrency, and it
//! stays isolated behind `LetterStore` so a transactional store can
//! replace it without touching the service.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};

use super::{
    asset_storage_name, AssetUrls, LetterStore, MediaBundle, StorageMode, StoreError, StoreHealth,
    UploadedAsset,
};
use crate::model::Letter;

pub const LETTERS_FILE: &str = "letters.json";
pub const UPLOADS_DIR: &str = "uploads";

pub struct LocalStore {
    letters_file: PathBuf,
    uploads_dir: PathBuf,
}

impl LocalStore {
    /// Open a local store rooted at `data_dir`, creating the layout on
    /// first run.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir).await?;
        let uploads_dir = data_dir.join(UPLOADS_DIR);
        fs::create_dir_all(&uploads_dir).await?;

        let letters_file = data_dir.join(LETTERS_FILE);
        if !fs::try_exists(&letters_file).await.unwrap_or(false) {
            fs::write(&letters_file, "[]").await?;
        }

        info!("Local letter store at {}", data_dir.display());
        Ok(Self {
            letters_file,
            uploads_dir,
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    async fn read_letters(&self) -> Result<Vec<Letter>, StoreError> {
        let raw = fs::read_to_string(&self.letters_file).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_letters(&self, letters: &[Letter]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(letters)?;
        fs::write(&self.letters_file, json).await?;
        Ok(())
    }

    async fn write_asset(&self, asset: &UploadedAsset) -> Result<String, StoreError> {
        let name = asset_storage_name(&asset.filename, Utc::now().timestamp_millis());
        let path = self.uploads_dir.join(&name);
        fs::write(&path, &asset.data).await?;
        debug!("Wrote asset {} ({} bytes)", name, asset.data.len());
        Ok(format!("/{UPLOADS_DIR}/{name}"))
    }
}

#[async_trait]
impl LetterStore for LocalStore {
    async fn put_assets(&self, media: MediaBundle) -> Result<AssetUrls, StoreError> {
        let mut urls = AssetUrls::default();
        for image in &media.images {
            urls.image_urls.push(self.write_asset(image).await?);
        }
        for video in &media.videos {
            urls.video_urls.push(self.write_asset(video).await?);
        }
        if let Some(audio) = &media.audio {
            urls.audio_url = Some(self.write_asset(audio).await?);
        }
        Ok(urls)
    }

    async fn create(&self, letter: &Letter) -> Result<(), StoreError> {
        let mut letters = self.read_letters().await?;
        letters.push(letter.clone());
        self.write_letters(&letters).await?;
        info!("Saved letter {}", letter.id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Letter>, StoreError> {
        self.read_letters().await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Letter>, StoreError> {
        Ok(self.read_letters().await?.into_iter().find(|l| l.id == id))
    }

    async fn update_pending(
        &self,
        id: &str,
        letter_content: &str,
        delay_minutes: i64,
    ) -> Result<bool, StoreError> {
        let mut letters = self.read_letters().await?;
        let Some(letter) = letters.iter_mut().find(|l| l.id == id) else {
            return Ok(false);
        };
        letter.letter_content = letter_content.to_string();
        letter.delay_minutes = Some(delay_minutes);
        letter.delay_days = Some(delay_minutes / 1440);
        self.write_letters(&letters).await?;
        Ok(true)
    }

    async fn health(&self) -> StoreHealth {
        match self.read_letters().await {
            Ok(letters) => StoreHealth {
                mode: StorageMode::Local,
                ok: true,
                detail: Some(format!("{} letters", letters.len())),
            },
            Err(e) => StoreHealth {
                mode: StorageMode::Local,
                ok: false,
                detail: Some(e.to_string()),
            },
        }
    }

    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }
}
