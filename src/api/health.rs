use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "qproxy-rs is running",
        "config": {
            "backend": config.backend.base_url,
            "mapped_models": config.backend.model_map.len(),
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "features": {
                "log_level": config.features.log_level,
            },
            "stream": {
                "fallback_failure_threshold": config.stream.fallback_failure_threshold,
                "max_frame_bytes": config.stream.max_frame_bytes,
            }
        }
    }))
}
