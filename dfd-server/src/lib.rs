//! dfd-server library - deepfake detection upload service
//!
//! Accepts a video upload, stores it, runs the external classifier on it and
//! answers with a rendered verdict page.

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use dfd_common::ServiceConfig;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

pub mod api;
pub mod error;
pub mod pipeline;

use pipeline::Pipeline;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub pipeline: Arc<Pipeline>,
    /// Server startup time
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ServiceConfig) -> Self {
        let pipeline = Pipeline::from_config(&config);
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// `/upload` and `/health` are handled here; every other path is served from
/// the static directory.
pub fn build_router(state: AppState) -> Router {
    let upload = Router::new()
        .route("/upload", post(api::upload_video))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes));

    let static_files = ServeDir::new(&state.config.static_dir);

    Router::new()
        .merge(upload)
        .merge(api::health_routes())
        .fallback_service(static_files)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ])
}
