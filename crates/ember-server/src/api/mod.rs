//! HTTP API: completion submission, streaming, cancellation, stats.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;
use uuid::Uuid;

use ember_core::{
    CancelOutcome, EngineStats, FinishReason, RequestSnapshot, SamplingParams, TokenId,
};

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/completions", post(completions))
        .route("/v1/requests/:id", get(request_status))
        .route("/v1/requests/:id/cancel", post(cancel))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

/// Completion request body. Either `prompt` (tokenized server-side) or
/// `prompt_tokens` must be present; sampling fields are inlined.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_tokens: Option<Vec<TokenId>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub request_id: String,
    pub token_ids: Vec<TokenId>,
    pub text: String,
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn completions(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = req
        .request_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let prompt_tokens = match (req.prompt_tokens, req.prompt.as_deref()) {
        (Some(tokens), _) => tokens,
        (None, Some(text)) => state.tokenizer.encode(text)?,
        (None, None) => {
            return Err(ApiError::invalid_request(
                "one of `prompt` or `prompt_tokens` is required",
            ));
        }
    };

    let mut sampling = req.sampling;
    if sampling.stop_token_ids.is_empty() {
        if let Some(eos) = state.tokenizer.eos_id() {
            sampling.stop_token_ids.push(eos);
        }
    }

    info!(
        request_id = %request_id,
        prompt_tokens = prompt_tokens.len(),
        stream = req.stream,
        "completion request"
    );

    if req.stream {
        let rx = state
            .engine
            .submit_streaming(request_id, prompt_tokens, sampling, req.priority)?;
        let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(|update| {
            let mut line = serde_json::to_vec(&update).unwrap_or_default();
            line.push(b'\n');
            Ok::<_, std::convert::Infallible>(line)
        }));
        return Ok((
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            body,
        )
            .into_response());
    }

    let output = state
        .engine
        .generate(request_id.clone(), prompt_tokens, sampling, req.priority)
        .await?;
    let text = state.tokenizer.decode(&output.token_ids)?;
    Ok(Json(CompletionResponse {
        request_id,
        token_ids: output.token_ids,
        text,
        finish_reason: output.finish_reason,
        error: output.error,
    })
    .into_response())
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.engine.cancel(&id)? {
        CancelOutcome::Cancelled => Ok(Json(json!({ "request_id": id, "cancelled": true }))),
        CancelOutcome::AlreadyFinished => Err(ApiError::already_finished(&id)),
    }
}

async fn request_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestSnapshot>, ApiError> {
    state
        .engine
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| ApiError::unknown_request(&id))
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = if state.engine.is_running() {
        "ok"
    } else {
        "shutting_down"
    };
    Json(json!({ "status": status }))
}
