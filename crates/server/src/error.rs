//! API error types.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use bazel_cache_storage::StorageError;

/// API error type.
///
/// Rendered as a plain-text body carrying the error message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        (
            status,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::from(StorageError::NotFound("cas/abc".into()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "object not found: cas/abc");
    }

    #[test]
    fn other_storage_errors_map_to_500() {
        for err in [
            StorageError::InvalidPath("foo".into()),
            StorageError::Config("bad".into()),
            StorageError::S3("boom".into()),
            StorageError::Io(std::io::Error::other("reset")),
        ] {
            assert_eq!(
                ApiError::from(err).status_code(),
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }
}
