//! Request errors and their JSON rendering.

use crate::engine::EngineError;
use crate::upload::UploadError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Body of every 500: internals go to the log, not to the client.
const PROCESSING_FAILED: &str = "Erro ao processar imagem";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing upload")]
    MissingUpload,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("payload too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },
    #[error("unprocessable image: {0}")]
    UnprocessableImage(String),
    #[error("inference failure: {0}")]
    InferenceFailure(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("inference capacity exhausted")]
    Busy,
    #[error("request timed out")]
    Timeout,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingUpload | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnprocessableImage(_)
            | ApiError::InferenceFailure(_)
            | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn client_message(&self) -> String {
        match self {
            ApiError::MissingUpload => "Nenhum arquivo enviado no campo 'foto'".to_string(),
            ApiError::BadRequest(detail) => format!("Requisição inválida: {detail}"),
            ApiError::UnsupportedMediaType(ct) => format!("Tipo de arquivo não suportado: {ct}"),
            ApiError::PayloadTooLarge { limit } => {
                format!("Arquivo excede o limite de {limit} bytes")
            }
            ApiError::UnprocessableImage(_) | ApiError::InferenceFailure(_) | ApiError::Storage(_) => {
                PROCESSING_FAILED.to_string()
            }
            ApiError::Busy => "Servidor ocupado, tente novamente".to_string(),
            ApiError::Timeout => "Tempo limite de processamento excedido".to_string(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Missing => ApiError::MissingUpload,
            UploadError::Duplicate | UploadError::Malformed(_) => ApiError::BadRequest(e.to_string()),
            UploadError::UnsupportedType(ct) => ApiError::UnsupportedMediaType(ct),
            UploadError::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
            UploadError::Io(io) => ApiError::Storage(io.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Decode(_) => ApiError::UnprocessableImage(e.to_string()),
            EngineError::Busy => ApiError::Busy,
            EngineError::Inference(_) | EngineError::ChannelClosed | EngineError::Spawn(_) => {
                ApiError::InferenceFailure(e.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    erro: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::info!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = ErrorResponse {
            erro: self.client_message(),
        };
        (status, Json(body)).into_response()
    }
}
