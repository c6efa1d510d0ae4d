use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use storage::QueryError;
use thiserror::Error;
use tracing::error;

pub(crate) const SERVER_ERROR_BODY: &str = "Server error";

/// Anything that stops a page from rendering. Every variant reaches the
/// client as the same opaque 500.
#[derive(Debug, Error)]
pub(crate) enum PageError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("template rendering failed: {0}")]
    Render(#[from] tera::Error),
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        error!(error = %self, "page request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_BODY).into_response()
    }
}
