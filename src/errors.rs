//! Client-facing error types.
//!
//! Every variant renders a fixed JSON message with the metadata media
//! type; internal causes are logged where they are translated and never
//! reach the response body.  Handlers return `Err(LfsError::NotFound)`
//! and let [`IntoResponse`] do the rest.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::META_MEDIA_TYPE;

/// Verbs the object routes answer, advertised with 405 responses.
pub const ALLOWED_METHODS: &str = "GET, HEAD, POST, OPTIONS";

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced to clients of the object routes.
#[derive(Debug, Error)]
pub enum LfsError {
    /// Unknown object or repository, or a backend failure on a lookup path.
    #[error("Not Found")]
    NotFound,

    /// Missing or rejected credential.
    #[error("Credentials needed")]
    Unauthorized,

    /// Valid credential without the needed permission.
    #[error("Forbidden")]
    Forbidden,

    /// The content store does not accept direct uploads.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// The request body could not be decoded.
    #[error("Bad request")]
    BadRequest,

    /// Size or content does not match the registered descriptor.
    #[error("Object does not match its descriptor")]
    Inconsistent,

    /// Catch-all for unexpected internal errors.
    #[error("Internal server error")]
    Internal,
}

impl LfsError {
    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LfsError::NotFound => StatusCode::NOT_FOUND,
            LfsError::Unauthorized => StatusCode::UNAUTHORIZED,
            LfsError::Forbidden => StatusCode::FORBIDDEN,
            LfsError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            LfsError::BadRequest => StatusCode::BAD_REQUEST,
            LfsError::Inconsistent => StatusCode::UNPROCESSABLE_ENTITY,
            LfsError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body shared by error and acknowledgement responses.
#[derive(Debug, Serialize)]
pub struct Message<'a> {
    pub message: &'a str,
}

/// Render `{"message": ...}` with the metadata media type.
pub fn message_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::to_vec(&Message { message }).unwrap_or_default();
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(META_MEDIA_TYPE))],
        body,
    )
        .into_response()
}

impl IntoResponse for LfsError {
    fn into_response(self) -> Response {
        let mut response = message_response(self.status_code(), &self.to_string());
        let headers = response.headers_mut();
        match self {
            LfsError::Unauthorized => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"git-media\""),
                );
            }
            LfsError::MethodNotAllowed => {
                headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
            }
            _ => {}
        }
        response
    }
}
