use std::sync::Arc;

use agent_relay_error::{ProblemDetails, RelayError};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use crate::driver::{AgentConfiguration, InvocationDriver, InvocationInput};
use crate::resolver::ProviderCredential;
use crate::sse::{BridgeConfig, SseBridge};

#[derive(Debug, Clone)]
pub struct AppState {
    driver: InvocationDriver,
    bridge: BridgeConfig,
}

impl AppState {
    pub fn new(driver: InvocationDriver) -> Self {
        Self {
            driver,
            bridge: BridgeConfig::default(),
        }
    }

    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state))
}

pub fn build_router_with_state(shared: Arc<AppState>) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/sessions/:session_id/prompt", post(post_prompt))
        .with_state(shared);

    Router::new()
        .nest("/v1", v1_router)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

/// Body of `POST /v1/sessions/{session_id}/prompt`. The session id comes from
/// the path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_credential: Option<ProviderCredential>,
    #[serde(default)]
    pub configuration: AgentConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
}

impl PromptRequest {
    pub fn into_input(self, session_id: String) -> InvocationInput {
        InvocationInput {
            prompt: self.prompt,
            session_id,
            working_directory: self.working_directory,
            model_id: self.model_id,
            provider_credential: self.provider_credential,
            configuration: self.configuration,
            resume_id: self.resume_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptQuery {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "include_raw"
    )]
    pub include_raw: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Starts an invocation and streams it back. Only a body that fails to
/// decode is answered with a problem document; every later failure,
/// validation included, arrives inside the event stream.
async fn post_prompt(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    query: Result<Query<PromptQuery>, QueryRejection>,
    body: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| RelayError::InvalidRequest {
        message: rejection.body_text(),
    })?;
    let Json(request) = body.map_err(|rejection| RelayError::InvalidRequest {
        message: rejection.body_text(),
    })?;

    let receiver = state.driver.start(request.into_input(session_id.clone()));
    let bridge = SseBridge::new(session_id, receiver, state.bridge.timeout)
        .with_raw(query.include_raw.unwrap_or(false));
    Ok(bridge.into_response(state.bridge.keep_alive))
}
