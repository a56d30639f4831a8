//! The `/v1*` client-facing surface (spec §6): OpenAI, Anthropic and Gemini
//! dialect entry points, gated by the shared API key. Routing itself is
//! peripheral (spec §1 Non-goals); this module only adapts axum's
//! extractors into the framework-neutral [`RequestOrchestrator`] calls.

use axum::Json;
use axum::body::Body;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde_json::json;

use gravgate_core::auth::{check_api_key, extract_api_key, requires_api_key};
use gravgate_core::orchestrator::{GatewayResponse, RequestContext};
use gravgate_protocol::{anthropic, gemini, openai};

use crate::state::AppState;

pub fn router(state: AppState) -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/{credential}/v1/chat/completions", post(openai_chat_forced))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .route("/v1/models", get(models_list))
        .route("/v1beta/models/{*rest}", post(gemini_generate))
        .layer(middleware::from_fn_with_state(state, api_key_gate))
}

/// Enforces the shared API key on any path matching `^/(?:[\w-]+/)?v1/`,
/// the same rule [`requires_api_key`] documents for the whole process.
async fn api_key_gate(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    if requires_api_key(uri.path()) {
        let pairs: Vec<(&str, &str)> = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        let presented = extract_api_key(pairs.into_iter());
        if let Err(err) = check_api_key(&state.api_key, presented.as_deref()) {
            return Err((StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(err.to_json()))
                .into_response());
        }
    }
    Ok(next.run(req).await)
}

fn request_context(method: &'static str, uri: &axum::http::Uri, headers: &HeaderMap) -> RequestContext {
    RequestContext {
        method,
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect(),
    }
}

fn to_response(resp: GatewayResponse) -> Response {
    match resp {
        GatewayResponse::Json { status, body } => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(body)).into_response()
        }
        GatewayResponse::Stream { status, content_type, body } => {
            let mut response = Response::new(Body::from_stream(body));
            *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderValue::from_static(content_type),
            );
            response
        }
    }
}

async fn openai_chat(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<openai::ChatCompletionRequest>,
) -> Response {
    let ctx = request_context("POST", &uri, &headers);
    to_response(state.orchestrator.handle_openai_chat(&ctx, None, body).await)
}

async fn openai_chat_forced(
    State(state): State<AppState>,
    Path(credential): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<openai::ChatCompletionRequest>,
) -> Response {
    let ctx = request_context("POST", &uri, &headers);
    to_response(state.orchestrator.handle_openai_chat(&ctx, Some(&credential), body).await)
}

async fn anthropic_messages(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<anthropic::MessagesRequest>,
) -> Response {
    let ctx = request_context("POST", &uri, &headers);
    to_response(state.orchestrator.handle_anthropic_messages(&ctx, None, body).await)
}

async fn anthropic_count_tokens(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<anthropic::MessagesRequest>,
) -> Response {
    let ctx = request_context("POST", &uri, &headers);
    to_response(state.orchestrator.handle_count_tokens(&ctx, body).await)
}

async fn models_list(State(state): State<AppState>) -> Response {
    to_response(state.orchestrator.handle_models_list().await)
}

/// `POST /v1beta/models/{model}:generateContent`. Axum's router matches
/// whole path segments, so the `{model}:generateContent` shape is captured
/// as a single wildcard tail and split on the last `:` here, mirroring the
/// aggregate-route pattern of splitting a compound path segment by hand.
async fn gemini_generate(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = rest.rsplit_once(':') else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": { "message": "expected model:action" } }))).into_response();
    };
    if action != "generateContent" {
        // Streaming Gemini is out of scope per spec §6 Open Questions: reject with 400.
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": format!("unsupported action: {action}") } })),
        )
            .into_response();
    }
    let parsed: gemini::GenerateContentRequest = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": { "message": err.to_string() } }))).into_response();
        }
    };
    let ctx = request_context("POST", &uri, &headers);
    to_response(state.orchestrator.handle_gemini_generate(&ctx, model, parsed).await)
}
