use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::{HeaderValue, Method, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{AppConfig, device_label},
    error::ServiceError,
    model::{GeneratorMetadata, PipelineState},
    pipeline::InferencePipeline,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<InferencePipeline>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    device: String,
    generator: PipelineState,
}

#[derive(Serialize)]
struct MetadataResponse {
    image_size: u32,
    state: PipelineState,
    generator: Option<GeneratorMetadata>,
}

pub fn build_router(config: Arc<AppConfig>, pipeline: Arc<InferencePipeline>) -> Router {
    let cors = cors_layer(&config.cors_origins);
    let body_limit = DefaultBodyLimit::max(config.max_body_bytes);
    let state = AppState { config, pipeline };

    Router::new()
        .route("/health", get(health))
        .route("/api/pix2pix", post(pix2pix))
        .route("/api/metadata", get(metadata))
        .with_state(state)
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Answers every OPTIONS request, preflight or not, with `200`.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(%origin, %err, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        device: device_label(state.pipeline.device()),
        generator: state.pipeline.state(),
    })
}

async fn pix2pix(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let body = body.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let png = state.pipeline.translate(body.to_vec()).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        image_size: state.config.image_size,
        state: state.pipeline.state(),
        generator: state.pipeline.metadata(),
    })
}
