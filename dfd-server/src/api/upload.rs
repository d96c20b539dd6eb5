//! Upload endpoint
//!
//! POST /upload takes a multipart body with the video in the `file` part and
//! answers with the rendered result page.

use axum::{
    extract::{
        multipart::{Multipart, MultipartRejection},
        State,
    },
    response::Html,
};
use tracing::info;

use crate::error::ApiResult;
use crate::AppState;

/// POST /upload
///
/// The extractor rejection is passed through so a malformed or oversized body
/// answers with the pipeline's own message instead of axum's default.
pub async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Html<String>> {
    let outcome = state.pipeline.run(multipart).await?;

    info!(
        declared_name = %outcome.asset.declared_name,
        size_bytes = outcome.asset.size_bytes,
        is_fake = outcome.verdict.is_fake,
        "Upload request completed"
    );

    Ok(Html(outcome.html))
}
