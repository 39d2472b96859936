//! HTTP surface: thin request/response mapping over the letter service.
//!
//! Every error body is `{"message": ...}`. Per-request failures never
//! kill the process; storage failures surface as 503 rather than being
//! silently absorbed.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use slowpost_core::config::UploadLimits;
use slowpost_core::country::RequestMeta;
use slowpost_core::model::{LetterWithStatus, PublicLetter, RawLetter};
use slowpost_core::service::{EditSummary, LetterService, PendingEdit, ServiceError};
use slowpost_core::store::{local::UPLOADS_DIR, StoreError, UploadedAsset};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LetterService>,
}

pub fn build_router(service: Arc<LetterService>, data_dir: &Path, limits: UploadLimits) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Whole-request ceiling; each asset is additionally capped
    // individually by the service.
    let body_limit = limits
        .max_asset_bytes
        .saturating_mul(limits.max_images + limits.max_videos + 2);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/letters", get(get_letters).post(create_letter))
        .route("/api/letters/:id", get(get_letter))
        .route("/api/letters/:id/edit", put(edit_letter))
        .nest_service("/uploads", ServeDir::new(data_dir.join(UPLOADS_DIR)))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Error shape for every failed API response.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Validation(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::WrongPassword => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            // A corrupt letters file is an internal defect; an
            // unreachable backend is a service condition.
            ServiceError::Storage(StoreError::Corrupt(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            warn!("Storage failure surfaced to client: {err}");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.service.health().await;
    Json(json!({
        "status": if health.ok { "ok" } else { "degraded" },
        "storage": health.mode,
        "detail": health.detail,
    }))
}

async fn get_letters(State(state): State<AppState>) -> Result<Json<Vec<PublicLetter>>, ApiError> {
    Ok(Json(state.service.get_all().await?))
}

async fn get_letter(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<LetterWithStatus>, ApiError> {
    Ok(Json(state.service.get_by_id(&id).await?))
}

async fn edit_letter(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Json(edit): Json<PendingEdit>,
) -> Result<Json<EditSummary>, ApiError> {
    Ok(Json(state.service.apply_pending_edit(&id, edit).await?))
}

async fn create_letter(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<PublicLetter>, ApiError> {
    let mut raw = RawLetter::default();
    let mut files: Vec<UploadedAsset> = Vec::new();
    let mut audio: Option<UploadedAsset> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "senderName" => raw.sender_name = Some(text_field(field).await?),
            "recipientName" => raw.recipient_name = Some(text_field(field).await?),
            "recipientEmail" => raw.recipient_email = Some(text_field(field).await?),
            "letterContent" => raw.letter_content = Some(text_field(field).await?),
            "delayMinutes" => raw.delay_minutes = Some(text_field(field).await?),
            "delayDays" => raw.delay_days = Some(text_field(field).await?),
            "delayHours" => raw.delay_hours = Some(text_field(field).await?),
            "delayMinutesPart" => raw.delay_minutes_part = Some(text_field(field).await?),
            "editPassword" => raw.edit_password = Some(text_field(field).await?),
            "paperTheme" => raw.paper_theme = Some(text_field(field).await?),
            "ambienceMusic" => raw.ambience_music = Some(text_field(field).await?),
            "stickers" => raw.stickers = Some(text_field(field).await?),
            "holidayTheme" => raw.holiday_theme = Some(text_field(field).await?),
            "stampData" => raw.stamp_data = Some(text_field(field).await?),
            "images" | "image" | "videos" | "video" => files.push(file_field(field).await?),
            "audio" => audio = Some(file_field(field).await?),
            other => {
                return Err(ApiError::bad_request(format!(
                    "Unsupported field '{other}'"
                )))
            }
        }
    }

    let meta = request_meta(&headers, connect_info.map(|info| info.0.ip()));
    let letter = state.service.create(raw, files, audio, meta).await?;
    Ok(Json(letter))
}

async fn text_field(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read field: {e}")))
}

async fn file_field(field: Field<'_>) -> Result<UploadedAsset, ApiError> {
    let filename = field.file_name().unwrap_or("").to_string();
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?
        .to_vec();
    Ok(UploadedAsset {
        filename,
        content_type,
        data,
    })
}

/// Country hints for the create path: an edge-provided country header if
/// present, else the client address (first X-Forwarded-For hop, else
/// the socket peer).
fn request_meta(headers: &HeaderMap, peer: Option<IpAddr>) -> RequestMeta {
    let country_header = ["x-vercel-ip-country", "cf-ipcountry"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .map(str::to_string);
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or(peer);
    RequestMeta {
        country_header,
        client_ip,
    }
}
