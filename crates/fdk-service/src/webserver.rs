// SPDX-License-Identifier: MIT OR Apache-2.0
//! Administrative REST surface and custom-route assembly.
//!
//! Every service exposes ping, version, config, and secret routes; the HTTP
//! trigger and user-registered custom routes merge into the same router.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use axum::{Json, Router};
use chrono::Utc;
use fdk_config::ServiceConfig;
use fdk_core::secrets::SecretProvider;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// API version stamped on administrative responses.
pub const API_VERSION: &str = "v3";

/// Routes owned by the SDK that custom routes must not collide with.
pub const RESERVED_ROUTES: &[&str] = &[
    "/api/v3/ping",
    "/api/v3/config",
    "/api/v3/version",
    "/api/v3/secret",
    "/api/v3/trigger",
];

/// State shared by the administrative handlers.
pub struct WebState {
    /// The service's key, echoed in admin responses.
    pub service_key: String,
    /// SDK version string, reported by the version route.
    pub sdk_version: String,
    /// The loaded configuration, reported by the config route.
    pub config: Arc<ServiceConfig>,
    /// Secret provider backing the secret route.
    pub secret_provider: Arc<dyn SecretProvider>,
}

/// Build the administrative router.
#[must_use]
pub fn admin_router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/api/v3/ping", get(cmd_ping))
        .route("/api/v3/config", get(cmd_config))
        .route("/api/v3/version", get(cmd_version))
        .route("/api/v3/secret", post(cmd_secret))
        .with_state(state)
}

/// A user route waiting to be merged into the service router.
pub struct CustomRoute {
    /// Route path, e.g. `/api/v3/my-data`.
    pub path: String,
    /// Handler methods for the path.
    pub handler: MethodRouter,
}

async fn cmd_ping(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(json!({
        "apiVersion": API_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
        "serviceName": state.service_key,
    }))
}

async fn cmd_version(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(json!({
        "apiVersion": API_VERSION,
        "version": state.sdk_version,
        "serviceName": state.service_key,
    }))
}

async fn cmd_config(State(state): State<Arc<WebState>>) -> Response {
    match serde_json::to_value(state.config.as_ref()) {
        Ok(config) => Json(json!({
            "apiVersion": API_VERSION,
            "serviceName": state.service_key,
            "config": config,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode configuration: {e}"),
        )
            .into_response(),
    }
}

/// Request body for `POST /api/v3/secret`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRequest {
    /// API version of the request shape.
    #[serde(default)]
    pub api_version: String,
    /// Name to store the secret under.
    pub secret_name: String,
    /// The secret's key-value entries.
    pub secret_data: Vec<SecretDataEntry>,
}

/// One key-value entry of a secret request.
#[derive(Debug, Deserialize, Serialize)]
pub struct SecretDataEntry {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: String,
}

async fn cmd_secret(
    State(state): State<Arc<WebState>>,
    Json(request): Json<SecretRequest>,
) -> Response {
    if request.secret_name.trim().is_empty() || request.secret_data.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "secretName and secretData are required",
        )
            .into_response();
    }

    let secrets = request
        .secret_data
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect();
    match state
        .secret_provider
        .store_secret(&request.secret_name, secrets)
    {
        Ok(()) => {
            info!(target: "fdk.service", secret = %request.secret_name, "secret stored");
            (
                StatusCode::CREATED,
                Json(json!({"apiVersion": API_VERSION, "statusCode": 201})),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to store secret: {e}"),
        )
            .into_response(),
    }
}
