//! Letter service: validation, delay normalization, password hashing,
//! country detection, and persistence, orchestrated over whichever
//! storage realization the process started with.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::UploadLimits;
use crate::country::{resolve_country, RequestMeta};
use crate::delay::{normalize_delay, DelayInput};
use crate::model::{
    Letter, LetterDraft, LetterWithStatus, PublicLetter, RawLetter, ValidationError,
};
use crate::password;
use crate::store::{LetterStore, MediaBundle, StoreError, StoreHealth, UploadedAsset};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Wrong password")]
    WrongPassword,
    #[error("Letter not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Pending-edit request body. Delay fields coerce loosely: clients have
/// sent both numbers and numeric strings over the product's life.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdit {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub letter_content: Option<String>,
    #[serde(default)]
    pub delay_days: Option<serde_json::Value>,
    #[serde(default)]
    pub delay_hours: Option<serde_json::Value>,
    #[serde(default)]
    pub delay_minutes_part: Option<serde_json::Value>,
}

/// Summary returned after a successful pending edit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSummary {
    pub message: String,
    pub letter_content: String,
    pub delay_minutes: i64,
}

pub struct LetterService {
    store: Arc<dyn LetterStore>,
    limits: UploadLimits,
}

impl LetterService {
    pub fn new(store: Arc<dyn LetterStore>, limits: UploadLimits) -> Self {
        Self { store, limits }
    }

    /// Create a letter from untrusted input: validate, normalize the
    /// delay, hash the password if the delay requires one, resolve the
    /// sender country best-effort, persist assets then the record, and
    /// return the password-stripped projection.
    pub async fn create(
        &self,
        raw: RawLetter,
        files: Vec<UploadedAsset>,
        audio: Option<UploadedAsset>,
        meta: RequestMeta,
    ) -> Result<PublicLetter, ServiceError> {
        let draft = LetterDraft::from_untrusted(raw)?;
        let media = self.partition_media(files, audio)?;

        let edit_password_hash = draft
            .edit_password
            .as_deref()
            .map(password::hash_password);

        // Best-effort only; a letter never fails because geolocation did.
        let sender_country = resolve_country(&meta).await;

        let urls = self.store.put_assets(media).await?;

        let now = Utc::now();
        let letter = Letter {
            id: Uuid::new_v4().to_string(),
            sender_name: draft.sender_name,
            recipient_name: draft.recipient_name,
            recipient_email: draft.recipient_email,
            sender_country,
            letter_content: draft.letter_content,
            delay_minutes: Some(draft.delay_minutes),
            delay_days: Some(draft.delay_minutes / 1440),
            schedule_time: now,
            created_at: now,
            image_urls: urls.image_urls,
            video_urls: urls.video_urls,
            audio_url: urls.audio_url,
            stamp_data: draft.stamp_data,
            paper_theme: draft.paper_theme,
            ambience_music: draft.ambience_music,
            stickers: draft.stickers,
            holiday_theme: draft.holiday_theme,
            edit_password_hash,
        };
        self.store.create(&letter).await?;
        info!(
            "Created letter {} (delay {} minutes)",
            letter.id,
            letter.canonical_delay_minutes()
        );
        Ok(letter.to_public())
    }

    pub async fn get_all(&self) -> Result<Vec<PublicLetter>, ServiceError> {
        Ok(self
            .store
            .get_all()
            .await?
            .iter()
            .map(Letter::to_public)
            .collect())
    }

    /// Read one letter with its live reveal projection.
    pub async fn get_by_id(&self, id: &str) -> Result<LetterWithStatus, ServiceError> {
        let letter = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        let status = letter.reveal_status(Utc::now());
        Ok(LetterWithStatus {
            letter: letter.to_public(),
            is_revealed: status.is_revealed,
            time_left: status.time_left_ms,
        })
    }

    /// Apply a password-gated edit to a letter that has not unlocked yet.
    /// Only the content and delay may change; everything else is frozen
    /// at creation.
    pub async fn apply_pending_edit(
        &self,
        id: &str,
        edit: PendingEdit,
    ) -> Result<EditSummary, ServiceError> {
        let password = edit
            .password
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ServiceError::BadRequest("Password is required".to_string()))?;

        let letter = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        if letter.reveal_status(Utc::now()).is_revealed {
            return Err(ServiceError::BadRequest(
                "Cannot edit after unlock".to_string(),
            ));
        }
        let Some(hash) = letter.edit_password_hash.as_deref() else {
            return Err(ServiceError::BadRequest(
                "Pending edit is not enabled for this letter".to_string(),
            ));
        };
        if !password::verify_password(password, hash) {
            return Err(ServiceError::WrongPassword);
        }

        let no_delay_fields = edit.delay_days.is_none()
            && edit.delay_hours.is_none()
            && edit.delay_minutes_part.is_none();
        let delay_minutes = if no_delay_fields {
            // A body without delay fields edits the content only.
            letter.canonical_delay_minutes()
        } else {
            normalize_delay(&DelayInput {
                total_minutes: None,
                days: json_component(edit.delay_days.as_ref()),
                hours: json_component(edit.delay_hours.as_ref()),
                minutes: json_component(edit.delay_minutes_part.as_ref()),
            })
        };
        let letter_content = edit.letter_content.unwrap_or(letter.letter_content);

        let updated = self
            .store
            .update_pending(id, &letter_content, delay_minutes)
            .await?;
        if !updated {
            return Err(ServiceError::NotFound);
        }
        info!(
            "Applied pending edit to letter {} (delay now {} minutes)",
            id, delay_minutes
        );
        Ok(EditSummary {
            message: "Letter updated".to_string(),
            letter_content,
            delay_minutes,
        })
    }

    pub async fn health(&self) -> StoreHealth {
        self.store.health().await
    }

    /// Partition uploads by declared MIME prefix (video/* against
    /// everything else, which displays as an image) and enforce the
    /// configured caps.
    fn partition_media(
        &self,
        files: Vec<UploadedAsset>,
        audio: Option<UploadedAsset>,
    ) -> Result<MediaBundle, ServiceError> {
        let mut media = MediaBundle::default();
        for file in files {
            self.check_size(&file)?;
            if file.content_type.starts_with("video/") {
                media.videos.push(file);
            } else {
                media.images.push(file);
            }
        }
        if media.images.len() > self.limits.max_images {
            return Err(ServiceError::BadRequest(format!(
                "Too many image files (max {})",
                self.limits.max_images
            )));
        }
        if media.videos.len() > self.limits.max_videos {
            return Err(ServiceError::BadRequest(format!(
                "Too many video files (max {})",
                self.limits.max_videos
            )));
        }
        if let Some(audio) = audio {
            self.check_size(&audio)?;
            media.audio = Some(audio);
        }
        Ok(media)
    }

    fn check_size(&self, asset: &UploadedAsset) -> Result<(), ServiceError> {
        if asset.data.len() > self.limits.max_asset_bytes {
            return Err(ServiceError::BadRequest(format!(
                "File '{}' exceeds the {} byte limit",
                asset.filename, self.limits.max_asset_bytes
            )));
        }
        Ok(())
    }
}

/// Coerce a JSON delay component: number, numeric string, or anything
/// else (which counts as present-but-zero, like an unparseable form
/// field).
fn json_component(value: Option<&serde_json::Value>) -> Option<f64> {
    let value = value?;
    Some(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn make_service() -> (TempDir, LetterService, Arc<LocalStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(tmp.path()).await.unwrap());
        let service = LetterService::new(store.clone(), UploadLimits::default());
        (tmp, service, store)
    }

    fn raw_letter() -> RawLetter {
        RawLetter {
            sender_name: Some("A".to_string()),
            recipient_name: Some("B".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_without_delay_reveals_immediately() {
        let (_tmp, service, _) = make_service().await;
        let created = service
            .create(raw_letter(), Vec::new(), None, RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(created.delay_minutes, 0);

        let read = service.get_by_id(&created.id).await.unwrap();
        assert!(read.is_revealed);
        assert_eq!(read.time_left, 0);
    }

    #[tokio::test]
    async fn create_with_delay_requires_password() {
        let (_tmp, service, _) = make_service().await;
        let mut raw = raw_letter();
        raw.delay_days = Some("1".to_string());
        raw.delay_hours = Some("0".to_string());
        raw.delay_minutes_part = Some("0".to_string());
        let result = service
            .create(raw, Vec::new(), None, RequestMeta::default())
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Validation(ValidationError::PasswordRequired))
        ));
    }

    #[tokio::test]
    async fn delayed_letter_is_pending_and_hash_is_stripped() {
        let (_tmp, service, store) = make_service().await;
        let mut raw = raw_letter();
        raw.delay_minutes_part = Some("1".to_string());
        raw.edit_password = Some("abcd".to_string());

        let created = service
            .create(raw, Vec::new(), None, RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(created.delay_minutes, 1);

        let read = service.get_by_id(&created.id).await.unwrap();
        assert!(!read.is_revealed);
        assert!(read.time_left > 0 && read.time_left <= 60_000);

        // Hash is persisted but never projected.
        let stored = store.get_by_id(&created.id).await.unwrap().unwrap();
        assert!(stored.edit_password_hash.is_some());
        let projected = serde_json::to_value(&read).unwrap();
        assert!(projected.get("editPasswordHash").is_none());
    }

    #[tokio::test]
    async fn pending_edit_flow() {
        let (_tmp, service, _) = make_service().await;
        let mut raw = raw_letter();
        raw.delay_days = Some("1".to_string());
        raw.edit_password = Some("abcd".to_string());
        let created = service
            .create(raw, Vec::new(), None, RequestMeta::default())
            .await
            .unwrap();

        // Wrong password leaves the letter unchanged.
        let wrong = service
            .apply_pending_edit(
                &created.id,
                PendingEdit {
                    password: Some("nope".to_string()),
                    letter_content: Some("tampered".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(wrong, Err(ServiceError::WrongPassword)));
        let read = service.get_by_id(&created.id).await.unwrap();
        assert_eq!(read.letter.letter_content, "");

        // Correct password updates content and delay.
        let summary = service
            .apply_pending_edit(
                &created.id,
                PendingEdit {
                    password: Some("abcd".to_string()),
                    letter_content: Some("rewritten".to_string()),
                    delay_days: Some(json!(0)),
                    delay_hours: Some(json!(2)),
                    delay_minutes_part: Some(json!("30")),
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.delay_minutes, 150);

        let read = service.get_by_id(&created.id).await.unwrap();
        assert_eq!(read.letter.letter_content, "rewritten");
        assert_eq!(read.letter.delay_minutes, 150);
    }

    #[tokio::test]
    async fn edit_is_refused_after_unlock() {
        let (_tmp, service, store) = make_service().await;

        // A letter whose reveal time has already passed.
        let now = Utc::now();
        let letter = Letter {
            id: "expired".to_string(),
            sender_name: "A".to_string(),
            recipient_name: "B".to_string(),
            recipient_email: None,
            sender_country: None,
            letter_content: "sealed".to_string(),
            delay_minutes: Some(1),
            delay_days: Some(0),
            schedule_time: now - Duration::minutes(5),
            created_at: now - Duration::minutes(5),
            image_urls: Vec::new(),
            video_urls: Vec::new(),
            audio_url: None,
            stamp_data: None,
            paper_theme: Default::default(),
            ambience_music: false,
            stickers: Vec::new(),
            holiday_theme: Default::default(),
            edit_password_hash: Some(password::hash_password("abcd")),
        };
        store.create(&letter).await.unwrap();

        let result = service
            .apply_pending_edit(
                "expired",
                PendingEdit {
                    password: Some("abcd".to_string()),
                    letter_content: Some("tampered".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::BadRequest(_))));

        // Nothing was mutated.
        let read = service.get_by_id("expired").await.unwrap();
        assert_eq!(read.letter.letter_content, "sealed");
        assert!(read.is_revealed);
    }

    #[tokio::test]
    async fn edit_requires_password_and_an_enabled_letter() {
        let (_tmp, service, _) = make_service().await;
        let created = service
            .create(raw_letter(), Vec::new(), None, RequestMeta::default())
            .await
            .unwrap();

        let missing = service
            .apply_pending_edit(&created.id, PendingEdit::default())
            .await;
        assert!(matches!(missing, Err(ServiceError::BadRequest(_))));

        let not_enabled = service
            .apply_pending_edit(
                &created.id,
                PendingEdit {
                    password: Some("abcd".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(not_enabled, Err(ServiceError::BadRequest(_))));

        let unknown = service
            .apply_pending_edit(
                "no-such-id",
                PendingEdit {
                    password: Some("abcd".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(unknown, Err(ServiceError::NotFound)));
    }

    #[tokio::test]
    async fn media_is_partitioned_by_mime_prefix() {
        let (_tmp, service, store) = make_service().await;
        let files = vec![
            UploadedAsset {
                filename: "a.png".to_string(),
                content_type: "image/png".to_string(),
                data: vec![1],
            },
            UploadedAsset {
                filename: "b.mp4".to_string(),
                content_type: "video/mp4".to_string(),
                data: vec![2],
            },
            UploadedAsset {
                filename: "c.jpg".to_string(),
                content_type: "image/jpeg".to_string(),
                data: vec![3],
            },
        ];
        let created = service
            .create(raw_letter(), files, None, RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(created.image_urls.len(), 2);
        assert_eq!(created.video_urls.len(), 1);
        assert!(created.video_urls[0].ends_with("b.mp4"));

        let stored = store.get_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.image_urls, created.image_urls);
    }

    #[tokio::test]
    async fn too_many_files_is_a_client_error() {
        let (_tmp, service, _) = make_service().await;
        let files: Vec<UploadedAsset> = (0..11)
            .map(|i| UploadedAsset {
                filename: format!("{i}.png"),
                content_type: "image/png".to_string(),
                data: vec![0],
            })
            .collect();
        let result = service
            .create(raw_letter(), files, None, RequestMeta::default())
            .await;
        assert!(matches!(result, Err(ServiceError::BadRequest(_))));
    }

    #[tokio::test]
    async fn oversized_file_is_a_client_error() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(tmp.path()).await.unwrap());
        let limits = UploadLimits {
            max_asset_bytes: 4,
            ..Default::default()
        };
        let service = LetterService::new(store, limits);
        let files = vec![UploadedAsset {
            filename: "big.png".to_string(),
            content_type: "image/png".to_string(),
            data: vec![0; 5],
        }];
        let result = service
            .create(raw_letter(), files, None, RequestMeta::default())
            .await;
        assert!(matches!(result, Err(ServiceError::BadRequest(_))));
    }

    #[test]
    fn json_components_coerce_loosely() {
        assert_eq!(json_component(Some(&json!(3))), Some(3.0));
        assert_eq!(json_component(Some(&json!("7"))), Some(7.0));
        assert_eq!(json_component(None), None);
        // Present but garbage: selects the triple branch, contributes 0.
        assert!(json_component(Some(&json!("abc"))).unwrap().is_nan());
        assert!(json_component(Some(&json!([1, 2]))).unwrap().is_nan());
    }
}
