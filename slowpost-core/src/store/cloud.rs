//! Cloud storage realization: a Postgres `letters` table plus an
//! S3-compatible object store.
//!
//! Two resilience behaviors live here. Asset uploads are serial, each
//! retried with linear backoff before the whole create aborts. Inserts
//! tolerate schema drift: when the remote table rejects a column
//! (SQLSTATE 42703) the field is dropped from the payload and the
//! statement retried, bounded. Reads default every optional column so a
//! drifted or older table never fails a read.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::{info, warn};

use super::{
    asset_storage_name, AssetUrls, LetterStore, MediaBundle, ObjectStore, StorageMode, StoreError,
    StoreHealth, UploadedAsset,
};
use crate::model::{stickers_from_tags, HolidayTheme, Letter, PaperTheme};
use crate::retry::retry_with_backoff;

/// Attempts per asset upload: one initial try plus two retries.
const UPLOAD_ATTEMPTS: u32 = 3;
/// Ceiling on statement retries while dropping unknown columns.
const MAX_DRIFT_ATTEMPTS: u32 = 12;
/// SQLSTATE for Postgres undefined_column.
const UNDEFINED_COLUMN: &str = "42703";

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS letters (
    id TEXT PRIMARY KEY,
    sender_name TEXT NOT NULL DEFAULT '',
    recipient_name TEXT NOT NULL DEFAULT '',
    recipient_email TEXT,
    sender_country TEXT,
    letter_content TEXT NOT NULL DEFAULT '',
    delay_minutes BIGINT,
    delay_days BIGINT,
    schedule_time TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    image_urls JSONB NOT NULL DEFAULT '[]'::jsonb,
    video_urls JSONB NOT NULL DEFAULT '[]'::jsonb,
    audio_url TEXT,
    stamp_data TEXT,
    paper_theme TEXT,
    ambience_music BOOLEAN NOT NULL DEFAULT FALSE,
    stickers JSONB NOT NULL DEFAULT '[]'::jsonb,
    holiday_theme TEXT,
    edit_password_hash TEXT
)";

pub struct CloudStore {
    pool: PgPool,
    objects: Arc<dyn ObjectStore>,
}

impl CloudStore {
    /// Connect to the database and make sure the letters table exists.
    /// An externally managed table that has drifted from this shape is
    /// fine; the insert path copes.
    pub async fn connect(
        database_url: &str,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        info!("Cloud letter store ready");
        Ok(Self { pool, objects })
    }

    async fn execute_with_drift<B>(
        &self,
        mut columns: Vec<(&'static str, ColumnValue)>,
        build_sql: B,
        id: Option<&str>,
    ) -> Result<u64, StoreError>
    where
        B: Fn(&[(&'static str, ColumnValue)]) -> String,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let sql = build_sql(&columns);
            let mut query = sqlx::query(&sql);
            for (_, value) in &columns {
                query = bind_value(query, value);
            }
            if let Some(id) = id {
                query = query.bind(id.to_string());
            }
            match query.execute(&self.pool).await {
                Ok(done) => return Ok(done.rows_affected()),
                Err(err) => {
                    let Some(column) = undefined_column(&err) else {
                        return Err(err.into());
                    };
                    if attempts >= MAX_DRIFT_ATTEMPTS || !drop_column(&mut columns, &column) {
                        return Err(err.into());
                    }
                    warn!(
                        "Remote letters table has no column '{}'; retrying without it ({}/{})",
                        column, attempts, MAX_DRIFT_ATTEMPTS
                    );
                }
            }
        }
    }
}

#[async_trait]
impl LetterStore for CloudStore {
    async fn put_assets(&self, media: MediaBundle) -> Result<AssetUrls, StoreError> {
        // Deliberately serial: bounded per-asset retry accounting beats
        // upload throughput here.
        let mut urls = AssetUrls::default();
        for image in &media.images {
            match upload_with_retry(self.objects.as_ref(), "images", image).await {
                Ok(url) => urls.image_urls.push(url),
                Err(e) => {
                    log_partial_uploads(&urls);
                    return Err(e);
                }
            }
        }
        for video in &media.videos {
            match upload_with_retry(self.objects.as_ref(), "videos", video).await {
                Ok(url) => urls.video_urls.push(url),
                Err(e) => {
                    log_partial_uploads(&urls);
                    return Err(e);
                }
            }
        }
        if let Some(audio) = &media.audio {
            match upload_with_retry(self.objects.as_ref(), "audio", audio).await {
                Ok(url) => urls.audio_url = Some(url),
                Err(e) => {
                    log_partial_uploads(&urls);
                    return Err(e);
                }
            }
        }
        Ok(urls)
    }

    async fn create(&self, letter: &Letter) -> Result<(), StoreError> {
        self.execute_with_drift(insert_columns(letter), build_insert_sql, None)
            .await?;
        info!("Saved letter {}", letter.id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Letter>, StoreError> {
        let rows = sqlx::query("SELECT * FROM letters ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(letter_from_row).collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Letter>, StoreError> {
        let row = sqlx::query("SELECT * FROM letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(letter_from_row))
    }

    async fn update_pending(
        &self,
        id: &str,
        letter_content: &str,
        delay_minutes: i64,
    ) -> Result<bool, StoreError> {
        let columns = vec![
            (
                "letter_content",
                ColumnValue::Text(Some(letter_content.to_string())),
            ),
            ("delay_minutes", ColumnValue::Int(delay_minutes)),
            ("delay_days", ColumnValue::Int(delay_minutes / 1440)),
        ];
        let affected = self
            .execute_with_drift(columns, build_update_sql, Some(id))
            .await?;
        Ok(affected > 0)
    }

    async fn health(&self) -> StoreHealth {
        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            return StoreHealth {
                mode: StorageMode::Cloud,
                ok: false,
                detail: Some(format!("database: {e}")),
            };
        }
        if let Err(e) = self.objects.check().await {
            return StoreHealth {
                mode: StorageMode::Cloud,
                ok: false,
                detail: Some(format!("object store: {e}")),
            };
        }
        StoreHealth {
            mode: StorageMode::Cloud,
            ok: true,
            detail: None,
        }
    }

    fn mode(&self) -> StorageMode {
        StorageMode::Cloud
    }
}

/// Upload one asset under `folder/`, retrying per the backoff contract.
pub(crate) async fn upload_with_retry(
    objects: &dyn ObjectStore,
    folder: &str,
    asset: &UploadedAsset,
) -> Result<String, StoreError> {
    let key = format!(
        "{}/{}",
        folder,
        asset_storage_name(&asset.filename, Utc::now().timestamp_millis())
    );
    let url = retry_with_backoff(UPLOAD_ATTEMPTS, &key, || {
        objects.upload(&key, &asset.content_type, &asset.data)
    })
    .await?;
    Ok(url)
}

/// Earlier uploads from an aborted create are not rolled back; name them
/// so the gap is observable instead of silent.
fn log_partial_uploads(urls: &AssetUrls) {
    let uploaded: Vec<&String> = urls
        .image_urls
        .iter()
        .chain(urls.video_urls.iter())
        .chain(urls.audio_url.iter())
        .collect();
    if !uploaded.is_empty() {
        warn!(
            "Aborting create with {} assets already uploaded (not rolled back): {:?}",
            uploaded.len(),
            uploaded
        );
    }
}

/// One column of a pending statement. Values are bound, never
/// interpolated into SQL.
#[derive(Debug, Clone)]
enum ColumnValue {
    Text(Option<String>),
    Int(i64),
    Bool(bool),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ColumnValue::Text(v) => query.bind(v.clone()),
        ColumnValue::Int(v) => query.bind(*v),
        ColumnValue::Bool(v) => query.bind(*v),
        ColumnValue::Json(v) => query.bind(v.clone()),
        ColumnValue::Timestamp(v) => query.bind(*v),
    }
}

fn insert_columns(letter: &Letter) -> Vec<(&'static str, ColumnValue)> {
    let delay_minutes = letter.canonical_delay_minutes();
    let sticker_tags: Vec<&str> = letter.stickers.iter().map(|s| s.as_str()).collect();
    vec![
        ("id", ColumnValue::Text(Some(letter.id.clone()))),
        (
            "sender_name",
            ColumnValue::Text(Some(letter.sender_name.clone())),
        ),
        (
            "recipient_name",
            ColumnValue::Text(Some(letter.recipient_name.clone())),
        ),
        (
            "recipient_email",
            ColumnValue::Text(letter.recipient_email.clone()),
        ),
        (
            "sender_country",
            ColumnValue::Text(letter.sender_country.clone()),
        ),
        (
            "letter_content",
            ColumnValue::Text(Some(letter.letter_content.clone())),
        ),
        ("delay_minutes", ColumnValue::Int(delay_minutes)),
        ("delay_days", ColumnValue::Int(delay_minutes / 1440)),
        ("schedule_time", ColumnValue::Timestamp(letter.schedule_time)),
        ("created_at", ColumnValue::Timestamp(letter.created_at)),
        (
            "image_urls",
            ColumnValue::Json(serde_json::json!(letter.image_urls)),
        ),
        (
            "video_urls",
            ColumnValue::Json(serde_json::json!(letter.video_urls)),
        ),
        ("audio_url", ColumnValue::Text(letter.audio_url.clone())),
        ("stamp_data", ColumnValue::Text(letter.stamp_data.clone())),
        (
            "paper_theme",
            ColumnValue::Text(Some(letter.paper_theme.as_str().to_string())),
        ),
        ("ambience_music", ColumnValue::Bool(letter.ambience_music)),
        ("stickers", ColumnValue::Json(serde_json::json!(sticker_tags))),
        (
            "holiday_theme",
            ColumnValue::Text(Some(letter.holiday_theme.as_str().to_string())),
        ),
        (
            "edit_password_hash",
            ColumnValue::Text(letter.edit_password_hash.clone()),
        ),
    ]
}

fn build_insert_sql(columns: &[(&'static str, ColumnValue)]) -> String {
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO letters ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    )
}

fn build_update_sql(columns: &[(&'static str, ColumnValue)]) -> String {
    let sets: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{} = ${}", name, i + 1))
        .collect();
    format!(
        "UPDATE letters SET {} WHERE id = ${}",
        sets.join(", "),
        columns.len() + 1
    )
}

/// If `err` is an undefined-column failure, extract the column name from
/// the Postgres message (`column "x" of relation "letters" does not
/// exist`).
fn undefined_column(err: &sqlx::Error) -> Option<String> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some(UNDEFINED_COLUMN) {
        return None;
    }
    parse_quoted_column(db_err.message())
}

fn parse_quoted_column(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    let name = &message[start..end];
    (!name.is_empty()).then(|| name.to_string())
}

/// Remove `name` from the payload. False when absent — the remote error
/// names a column we are not sending, so retrying cannot converge.
fn drop_column(columns: &mut Vec<(&'static str, ColumnValue)>, name: &str) -> bool {
    let before = columns.len();
    columns.retain(|(column, _)| *column != name);
    columns.len() != before
}

fn text_column(row: &PgRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column).ok().flatten()
}

fn url_list_column(row: &PgRow, column: &str) -> Vec<String> {
    row.try_get::<Option<serde_json::Value>, _>(column)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Map a row to a Letter, defaulting every optional column so reads
/// never fail against an older or drifted schema.
fn letter_from_row(row: &PgRow) -> Letter {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    Letter {
        id: text_column(row, "id").unwrap_or_default(),
        sender_name: text_column(row, "sender_name").unwrap_or_default(),
        recipient_name: text_column(row, "recipient_name").unwrap_or_default(),
        recipient_email: text_column(row, "recipient_email"),
        sender_country: text_column(row, "sender_country"),
        letter_content: text_column(row, "letter_content").unwrap_or_default(),
        delay_minutes: row.try_get::<Option<i64>, _>("delay_minutes").ok().flatten(),
        delay_days: row.try_get::<Option<i64>, _>("delay_days").ok().flatten(),
        schedule_time: row
            .try_get::<DateTime<Utc>, _>("schedule_time")
            .unwrap_or(epoch),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").unwrap_or(epoch),
        image_urls: url_list_column(row, "image_urls"),
        video_urls: url_list_column(row, "video_urls"),
        audio_url: text_column(row, "audio_url"),
        stamp_data: text_column(row, "stamp_data"),
        paper_theme: PaperTheme::parse_or_default(text_column(row, "paper_theme").as_deref()),
        ambience_music: row
            .try_get::<Option<bool>, _>("ambience_music")
            .ok()
            .flatten()
            .unwrap_or(false),
        stickers: row
            .try_get::<Option<serde_json::Value>, _>("stickers")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
            .map(stickers_from_tags)
            .unwrap_or_default(),
        holiday_theme: HolidayTheme::parse_or_default(
            text_column(row, "holiday_theme").as_deref(),
        ),
        edit_password_hash: text_column(row, "edit_password_hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_the_offending_column_name() {
        assert_eq!(
            parse_quoted_column(r#"column "stamp_data" of relation "letters" does not exist"#),
            Some("stamp_data".to_string())
        );
        assert_eq!(parse_quoted_column("no quotes here"), None);
        assert_eq!(parse_quoted_column(r#"empty "" name"#), None);
    }

    #[test]
    fn drop_column_shrinks_payload_once() {
        let letter = sample_letter();
        let mut columns = insert_columns(&letter);
        let before = columns.len();

        assert!(drop_column(&mut columns, "stamp_data"));
        assert_eq!(columns.len(), before - 1);
        // A column we are not sending cannot be dropped again.
        assert!(!drop_column(&mut columns, "stamp_data"));
        assert!(!drop_column(&mut columns, "not_a_column"));
    }

    #[test]
    fn insert_sql_binds_every_column() {
        let letter = sample_letter();
        let columns = insert_columns(&letter);
        let sql = build_insert_sql(&columns);
        assert!(sql.starts_with("INSERT INTO letters (id, sender_name"));
        assert!(sql.contains(&format!("${}", columns.len())));
        assert!(!sql.contains(&format!("${}", columns.len() + 1)));
    }

    #[test]
    fn update_sql_appends_the_id_placeholder() {
        let columns = vec![
            ("letter_content", ColumnValue::Text(Some("x".into()))),
            ("delay_minutes", ColumnValue::Int(5)),
        ];
        assert_eq!(
            build_update_sql(&columns),
            "UPDATE letters SET letter_content = $1, delay_minutes = $2 WHERE id = $3"
        );
    }

    struct FlakyObjectStore {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyObjectStore {
        async fn upload(
            &self,
            key: &str,
            _content_type: &str,
            _data: &[u8],
        ) -> Result<String, ObjectStoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ObjectStoreError::Sdk("transient".to_string()))
            } else {
                Ok(format!("https://bucket/{key}"))
            }
        }

        async fn check(&self) -> Result<(), ObjectStoreError> {
            Ok(())
        }
    }

    fn sample_asset() -> UploadedAsset {
        UploadedAsset {
            filename: "photo.png".to_string(),
            content_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        }
    }

    fn sample_letter() -> Letter {
        let now = Utc::now();
        Letter {
            id: "test".to_string(),
            sender_name: "A".to_string(),
            recipient_name: "B".to_string(),
            recipient_email: None,
            sender_country: None,
            letter_content: String::new(),
            delay_minutes: Some(0),
            delay_days: Some(0),
            schedule_time: now,
            created_at: now,
            image_urls: Vec::new(),
            video_urls: Vec::new(),
            audio_url: None,
            stamp_data: Some("data:image/png;base64,AAAA".to_string()),
            paper_theme: Default::default(),
            ambience_music: false,
            stickers: Vec::new(),
            holiday_theme: Default::default(),
            edit_password_hash: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upload_recovers_within_the_retry_budget() {
        let store = FlakyObjectStore {
            failures: 2,
            calls: AtomicUsize::new(0),
        };
        let url = upload_with_retry(&store, "images", &sample_asset())
            .await
            .unwrap();
        assert!(url.starts_with("https://bucket/images/"));
        assert!(url.ends_with("photo.png"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_aborts_after_three_attempts() {
        let store = FlakyObjectStore {
            failures: 10,
            calls: AtomicUsize::new(0),
        };
        let result = upload_with_retry(&store, "images", &sample_asset()).await;
        assert!(matches!(result, Err(StoreError::ObjectStore(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn asset_keys_are_foldered_by_kind() {
        let name = asset_storage_name("clip.mp4", 99);
        assert_eq!(format!("videos/{name}"), "videos/99-clip.mp4");
    }
}
