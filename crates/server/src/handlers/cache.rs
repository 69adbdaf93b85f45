//! Bazel HTTP remote cache endpoints.
//!
//! `GET`/`PUT` on `/ac/{id}` and `/cas/{id}`. The namespace is fixed by the
//! route; the digest is passed through to storage untouched.

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bazel_cache_core::Namespace;
use bazel_cache_storage::{ByteStream, StorageError};
use futures::{StreamExt, TryStreamExt};

/// GET /ac/{id}
pub async fn get_action_result(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<Response, ApiError> {
    get_entry(&state, Namespace::Ac, digest).await
}

/// PUT /ac/{id}
pub async fn put_action_result(
    State(state): State<AppState>,
    Path(digest): Path<String>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    put_entry(&state, Namespace::Ac, &digest, body).await
}

/// GET /cas/{id}
pub async fn get_blob(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<Response, ApiError> {
    get_entry(&state, Namespace::Cas, digest).await
}

/// PUT /cas/{id}
pub async fn put_blob(
    State(state): State<AppState>,
    Path(digest): Path<String>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    put_entry(&state, Namespace::Cas, &digest, body).await
}

/// Stream a stored entry back as the response body.
///
/// Once headers are sent a backend failure can only cut the body short, so
/// such errors are logged here and the connection is terminated.
async fn get_entry(
    state: &AppState,
    namespace: Namespace,
    digest: String,
) -> Result<Response, ApiError> {
    let object = state.store.get(namespace.as_str(), &digest).await?;

    let body_stream = object.body.inspect_err(move |e| {
        tracing::warn!(
            namespace = %namespace,
            digest = %digest,
            error = %e,
            "Cache entry stream failed mid-transfer"
        );
    });

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body_stream),
    )
        .into_response();

    if let Some(size) = object.size {
        response.headers_mut().insert(CONTENT_LENGTH, size.into());
    }

    Ok(response)
}

/// Stream the request body into storage.
async fn put_entry(
    state: &AppState,
    namespace: Namespace,
    digest: &str,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(|e| StorageError::Io(std::io::Error::other(e)))),
    );

    let stored = state.store.put(namespace.as_str(), digest, stream).await?;

    tracing::debug!(
        namespace = %namespace,
        digest = %digest,
        bytes = stored,
        "Stored cache entry"
    );

    Ok(StatusCode::NO_CONTENT)
}
