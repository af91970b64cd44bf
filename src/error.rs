use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// After https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub enum ServiceError {
    /// The request itself is invalid, the message is safe to show the caller
    BadRequest(String),
    /// The model ran but returned no usable text
    TranscriptionFailed,
    Internal(anyhow::Error),
}

/// The envelope returned for every failed request
#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    status: &'static str,
    error: String,
    transcribed_text: Option<String>,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse {
            status: "error",
            error: message,
            transcribed_text: None,
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::TranscriptionFailed | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn message(&self) -> String {
        match self {
            ServiceError::BadRequest(message) => message.clone(),
            ServiceError::TranscriptionFailed => "Transcription failed".into(),
            ServiceError::Internal(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let mut res = Json(HttpErrorResponse::from(self.message())).into_response();
        *res.status_mut() = self.status();
        res
    }
}

impl<E> From<E> for ServiceError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ServiceError::Internal(err.into())
    }
}

/// A broken multipart body is the caller's fault
pub fn bad_multipart(err: MultipartError) -> ServiceError {
    ServiceError::BadRequest(err.body_text())
}

pub type ServiceResult<T, E = ServiceError> = Result<T, E>;

#[macro_export]
macro_rules! bail_request {
    ($error_message:expr) => {
        return Err($crate::error::ServiceError::BadRequest(($error_message).into()))
    };
    ($fmt:expr $(, $arg:expr)+) => {
        return Err($crate::error::ServiceError::BadRequest(format!($fmt $(, $arg)+)))
    };
}
