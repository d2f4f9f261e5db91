use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::recognizer::PredictError;

/// `/predict` のエラーレスポンス
///
/// 本文は `{"error": "..."}`。サーバー側の失敗は一行の概要のみ返し、詳細はログにのみ出す。
#[derive(Debug)]
pub struct ApiError(pub PredictError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PredictError::MissingImage
            | PredictError::InvalidUpload(_)
            | PredictError::Decode(_) => StatusCode::BAD_REQUEST,
            PredictError::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            PredictError::ServiceUnavailable(_)
            | PredictError::Inference(_)
            | PredictError::TopK(_)
            | PredictError::EmptyRanking => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// クライアントへ返すメッセージ
    pub fn client_message(&self) -> String {
        match &self.0 {
            PredictError::ServiceUnavailable(_) => {
                "Food recognition model is not available, please try again later".to_string()
            }
            PredictError::Inference(_) | PredictError::TopK(_) | PredictError::EmptyRanking => {
                "Prediction failed".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
        }

        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Prediction error: {:?}", self.0);
        } else {
            tracing::warn!("Bad request: {}", self.0);
        }

        (
            status,
            Json(ErrorBody {
                error: self.client_message(),
            }),
        )
            .into_response()
    }
}
