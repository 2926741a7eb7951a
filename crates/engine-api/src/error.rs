use std::fmt::Display;

use axum::{extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use hyper::http;
use thiserror::Error;
use vigil_core::service::ServiceError;

/// Failure of a relay endpoint, rendered as status code and text body.
#[derive(Debug)]
pub enum EngineApiError {
    BadRequest(String),
    NotFound(String),
    NotImplemented(String),
    GatewayTimeout,
    BadGateway(String),
    InternalServerError,
}

/// Error types for the Engine API client
#[derive(Debug, Error)]
pub enum EngineClientError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] http::uri::InvalidUri),

    /// For client.request() errors
    #[error("Hyper client error: {0}")]
    HyperError(#[from] hyper_util::client::legacy::Error),

    /// For res.collect() errors
    #[error("Error collecting response: {0}")]
    CollectResponseError(#[from] hyper::Error),

    #[error("Failed to build request: {0}")]
    RequestBuilderError(#[from] http::Error),

    #[error("Serialization error: {0}")]
    SerializeError(String),

    #[error("Deserialization error: {0}")]
    DeserializeError(String),

    #[error("HTTP error {status}: {message}")]
    UnexpectedResponse { status: u16, message: String },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for EngineClientError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Io => {
                Self::SerializeError(format!("IO error during serialization: {err}"))
            }
            serde_json::error::Category::Syntax => {
                Self::DeserializeError(format!("JSON syntax error: {err}"))
            }
            serde_json::error::Category::Data => {
                Self::DeserializeError(format!("JSON data error: {err}"))
            }
            serde_json::error::Category::Eof => {
                Self::DeserializeError(format!("Unexpected end of JSON input: {err}"))
            }
        }
    }
}

impl From<EngineClientError> for ServiceError {
    fn from(err: EngineClientError) -> Self {
        match err {
            EngineClientError::UnexpectedResponse { status, message } => match status {
                400 => ServiceError::InvalidArgument(message),
                404 => ServiceError::NotFound(message),
                501 => ServiceError::Unimplemented(message),
                502 | 503 => ServiceError::Unavailable(message),
                504 => ServiceError::Unavailable(format!("upstream timed out: {message}")),
                _ => ServiceError::Internal(format!("HTTP error {status}: {message}")),
            },
            EngineClientError::HyperError(_)
            | EngineClientError::CollectResponseError(_)
            | EngineClientError::Connect { .. } => ServiceError::Unavailable(err.to_string()),
            EngineClientError::InvalidUrl(_)
            | EngineClientError::RequestBuilderError(_)
            | EngineClientError::SerializeError(_)
            | EngineClientError::DeserializeError(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

impl Display for EngineApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl EngineApiError {
    fn status_code(&self) -> StatusCode {
        match *self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineApiError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code();

        match self {
            Self::BadRequest(msg)
            | Self::NotFound(msg)
            | Self::NotImplemented(msg)
            | Self::BadGateway(msg) => (status_code, msg).into_response(),
            Self::GatewayTimeout => (status_code, "upstream deadline exceeded").into_response(),
            Self::InternalServerError => (status_code, "internal").into_response(),
        }
    }
}

impl From<ServiceError> for EngineApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::InvalidArgument(msg) => Self::BadRequest(msg),
            ServiceError::NotFound(msg) => Self::NotFound(msg),
            ServiceError::Unimplemented(msg) => Self::NotImplemented(msg),
            ServiceError::DeadlineExceeded(_) => Self::GatewayTimeout,
            ServiceError::Unavailable(msg) => Self::BadGateway(msg),
            ServiceError::Internal(msg) => {
                log::error!("Unexpected Error {msg}");
                Self::InternalServerError
            }
        }
    }
}

impl From<JsonRejection> for EngineApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}
