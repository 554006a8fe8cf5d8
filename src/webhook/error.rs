//! Failures of the admission endpoint and their fixed HTTP bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid method: only POST requests are allowed")]
    InvalidMethod,

    #[error("only content type 'application/json' is supported")]
    InvalidContentType,

    #[error("could not deserialize request: {0}")]
    Deserialize(String),

    #[error("malformed admission review: request is nil")]
    MissingRequest,

    /// The bound hook (or the capability behind it) failed.
    #[error("admission hook failed")]
    HookFailed,

    #[error("unable to marshal the json patch")]
    PatchSerialization,

    #[error("unable to marshal the admission response")]
    ResponseSerialization,
}

impl ProtocolError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidContentType | Self::Deserialize(_) | Self::MissingRequest => {
                StatusCode::BAD_REQUEST
            }
            Self::HookFailed | Self::PatchSerialization | Self::ResponseSerialization => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProtocolError::InvalidMethod.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(ProtocolError::InvalidContentType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProtocolError::MissingRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProtocolError::Deserialize("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProtocolError::HookFailed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ProtocolError::PatchSerialization.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_fixed_bodies() {
        assert_eq!(
            ProtocolError::Deserialize("expected value at line 1 column 1".into()).to_string(),
            "could not deserialize request: expected value at line 1 column 1"
        );
        assert_eq!(
            ProtocolError::MissingRequest.to_string(),
            "malformed admission review: request is nil"
        );
    }
}
