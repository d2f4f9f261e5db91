use axum::{
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        State,
    },
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::recognizer::{DownloadError, PredictError};
use crate::server::{error::ApiError, AppState};
use crate::types::{ModelStatus, OperationStatus, PredictionResponse};

/// アップロード画像のフィールド名
const IMAGE_FIELD: &str = "image";

#[tracing::instrument(name = "POST /predict", skip_all)]
pub async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let multipart = multipart.map_err(|e| PredictError::InvalidUpload(e.body_text()))?;
    let image = read_image_field(multipart).await?;

    let response = state.predict(image).await?;
    Ok(Json(response))
}

/// `image` フィールドの中身を取り出す
///
/// ファイル名が空、または内容が空の場合は画像なしとして扱う。
async fn read_image_field(mut multipart: Multipart) -> Result<Vec<u8>, PredictError> {
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        if field.file_name().map_or(true, str::is_empty) {
            return Err(PredictError::MissingImage);
        }

        let bytes = field.bytes().await.map_err(upload_error)?;
        if bytes.is_empty() {
            return Err(PredictError::MissingImage);
        }
        return Ok(bytes.to_vec());
    }

    Err(PredictError::MissingImage)
}

fn upload_error(e: MultipartError) -> PredictError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PredictError::UploadTooLarge
    } else {
        PredictError::InvalidUpload(e.body_text())
    }
}

#[tracing::instrument(name = "GET /model-status", skip_all)]
pub async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    Json(state.status())
}

#[tracing::instrument(name = "POST /download-pretrained", skip_all)]
pub async fn download_pretrained(
    State(state): State<AppState>,
) -> (StatusCode, Json<OperationStatus>) {
    match state.download_weights().await {
        Ok(message) => (StatusCode::OK, Json(OperationStatus::success(message))),
        Err(e) => {
            tracing::error!("Weights download failed: {}", e);
            let message = match e {
                DownloadError::NotConfigured => e.to_string(),
                _ => "Failed to download pre-trained weights".to_string(),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OperationStatus::error(message)),
            )
        }
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Food recognition server is running"
    }))
}
