//! Technical endpoint
//!
//! Separate listener for operational concerns: candidate-config
//! validation (POST /), Prometheus metrics and a health probe.

use crate::metrics::ProxyMetrics;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use http::StatusCode;
use repligate_common::config::ConfigError;
use repligate_common::ProxyConfig;
use std::sync::Arc;

/// Build the technical router
pub fn technical_router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/", post(validate_config))
        .route("/metrics", get(render_metrics))
        .route("/health", get(|| async { "OK" }))
        .with_state(metrics)
}

/// Validate a candidate YAML configuration: 200 when it would be
/// accepted, 400 when it does not parse, 406 when it parses but violates
/// a constraint.
async fn validate_config(body: String) -> impl IntoResponse {
    let config = match ProxyConfig::from_yaml(&body) {
        Ok(config) => config,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, format!("unparsable configuration: {error}\n"))
        }
    };
    match config.validate() {
        Ok(()) => (StatusCode::OK, "configuration is valid\n".to_string()),
        Err(ConfigError::Invalid(reason)) | Err(ConfigError::Parse(reason)) => {
            (StatusCode::NOT_ACCEPTABLE, format!("invalid configuration: {reason}\n"))
        }
    }
}

async fn render_metrics(State(metrics): State<Arc<ProxyMetrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
