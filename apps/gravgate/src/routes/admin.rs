//! Panel-authorized routes (spec §6): credential enumeration/import/refresh,
//! OAuth consent-URL plumbing, and the usage/log endpoints. Panel session
//! authentication and CSRF handling are peripheral (spec §1 Non-goals); this
//! module implements the minimum needed to exercise [`PanelSessionStore`] as
//! the authorization capability the core already defines, plus a login
//! route so the bearer token has somewhere to come from.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use gravgate_credential::{Credential, ImportOptions, OAuthError};

use crate::state::AppState;

pub fn router(state: AppState) -> axum::Router<AppState> {
    axum::Router::new()
        .route("/auth/login", post(login))
        .route("/auth/accounts", get(list_accounts))
        .route("/auth/accounts/import-toml", post(import_toml))
        .route("/auth/accounts/{index}/refresh", post(refresh_one))
        .route("/auth/accounts/refresh-all", post(refresh_all))
        .route("/auth/accounts/{index}/enable", post(set_enabled))
        .route("/auth/accounts/{index}", delete(remove_account))
        .route("/auth/accounts/{index}/refresh-project-id", post(refresh_project_id))
        .route("/auth/oauth/url", get(oauth_url))
        .route("/auth/oauth/parse-url", post(parse_oauth_url))
        .route("/admin/logs", get(recent_logs))
        .route("/admin/logs/{id}", get(log_detail))
        .route("/admin/logs/clear", post(clear_logs))
        .route("/admin/logs/usage", get(usage_summary))
        .layer(middleware::from_fn_with_state(state, panel_auth_gate))
}

async fn panel_auth_gate(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    if req.uri().path() == "/auth/login" {
        return Ok(next.run(req).await);
    }
    let token = headers
        .get("x-panel-session")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    match token {
        Some(token) if state.panel_sessions.validate(token) => Ok(next.run(req).await),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "panel session required" }))).into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    if body.username == state.panel_user && body.password == state.panel_password {
        let token = state.panel_sessions.issue();
        (StatusCode::OK, Json(json!({ "token": token }))).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" }))).into_response()
    }
}

fn sanitize(credential: &Credential, index: usize) -> Value {
    json!({
        "index": index,
        "email": credential.email,
        "project_id": credential.project_id,
        "enabled": credential.enabled,
        "created_at": credential.created_at,
        "has_access_token": credential.access_token.is_some(),
        "fresh": credential.is_fresh_enough(),
    })
}

async fn list_accounts(State(state): State<AppState>) -> Response {
    let accounts = state.pool.enumerate().await;
    let rows: Vec<Value> = accounts.iter().enumerate().map(|(i, c)| sanitize(c, i)).collect();
    Json(json!({ "accounts": rows })).into_response()
}

#[derive(Debug, Deserialize)]
struct ImportTomlRequest {
    toml: String,
    #[serde(default)]
    replace_existing: bool,
    #[serde(default)]
    filter_disabled: bool,
}

#[derive(Debug, Deserialize)]
struct TomlCredential {
    refresh_token: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct TomlImportFile {
    #[serde(default)]
    accounts: Vec<TomlCredential>,
}

async fn import_toml(State(state): State<AppState>, Json(body): Json<ImportTomlRequest>) -> Response {
    let parsed: TomlImportFile = match toml::from_str(&body.toml) {
        Ok(value) => value,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response();
        }
    };
    let records: Vec<Credential> = parsed
        .accounts
        .into_iter()
        .map(|record| {
            let mut credential = Credential::new(record.refresh_token);
            credential.access_token = record.access_token;
            credential.expires_in = record.expires_in;
            credential.issued_at = credential.access_token.as_ref().map(|_| gravgate_common::now_ms());
            credential.project_id = record.project_id;
            credential.email = record.email;
            credential.enabled = record.enabled;
            credential
        })
        .collect();
    let opts = ImportOptions { replace_existing: body.replace_existing, filter_disabled: body.filter_disabled };
    match state.pool.import(records, opts).await {
        Ok(summary) => Json(serde_json::to_value(summary).unwrap_or(Value::Null)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn refresh_one(State(state): State<AppState>, Path(index): Path<usize>) -> Response {
    match state.pool.refresh_at(index).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => credential_error_response(err),
    }
}

async fn refresh_all(State(state): State<AppState>) -> Response {
    let summary = state.pool.refresh_all().await;
    Json(serde_json::to_value(summary).unwrap_or(Value::Null)).into_response()
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    enable: bool,
}

async fn set_enabled(State(state): State<AppState>, Path(index): Path<usize>, Json(body): Json<EnableRequest>) -> Response {
    match state.pool.set_enabled(index, body.enable).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => credential_error_response(err),
    }
}

async fn remove_account(State(state): State<AppState>, Path(index): Path<usize>) -> Response {
    match state.pool.remove_at(index).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => credential_error_response(err),
    }
}

async fn refresh_project_id(State(state): State<AppState>, Path(index): Path<usize>) -> Response {
    match state.pool.resolve_project_id_at(index, true).await {
        Ok(project_id) => Json(json!({ "project_id": project_id })).into_response(),
        Err(err) => credential_error_response(err),
    }
}

fn credential_error_response(err: gravgate_credential::PoolError) -> Response {
    let status = match &err {
        gravgate_credential::PoolError::CredentialNotFound => StatusCode::NOT_FOUND,
        gravgate_credential::PoolError::NoCredentialAvailable => StatusCode::SERVICE_UNAVAILABLE,
        gravgate_credential::PoolError::Oauth(OAuthError::ProjectIdMissing) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct OAuthUrlQuery {
    redirect_uri: String,
}

async fn oauth_url(State(state): State<AppState>, Query(query): Query<OAuthUrlQuery>) -> Response {
    let challenge = gravgate_credential::generate_pkce_challenge();
    let url = state.pool.oauth().build_auth_url(&query.redirect_uri, &challenge);
    let state_key = challenge.state.clone();
    state.pending_oauth.challenges.lock().await.insert(state_key.clone(), challenge);
    Json(json!({ "url": url, "state": state_key })).into_response()
}

#[derive(Debug, Deserialize)]
struct ParseOAuthUrlRequest {
    url: String,
    redirect_uri: String,
}

async fn parse_oauth_url(State(state): State<AppState>, Json(body): Json<ParseOAuthUrlRequest>) -> Response {
    let Some((code, oauth_state)) = extract_code_and_state(&body.url) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "callback url is missing code/state" }))).into_response();
    };
    let Some(challenge) = state.pending_oauth.challenges.lock().await.remove(&oauth_state) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unknown or expired oauth state" }))).into_response();
    };
    let tokens = match state.pool.oauth().exchange_code(&code, &body.redirect_uri, &challenge.code_verifier).await {
        Ok(tokens) => tokens,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    };
    let Some(refresh_token) = tokens.refresh_token else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "upstream did not return a refresh token" })),
        )
            .into_response();
    };
    let mut credential = Credential::new(refresh_token);
    credential.apply_refresh(tokens.access_token.clone(), tokens.expires_in);
    credential.email = state.pool.oauth().fetch_user_email(&tokens.access_token).await;
    if let Ok(project_id) = state.pool.oauth().resolve_project_id(&tokens.access_token, true).await {
        credential.set_project_id_if_absent(project_id);
    }
    let opts = ImportOptions { replace_existing: false, filter_disabled: false };
    match state.pool.import(vec![credential], opts).await {
        Ok(summary) => Json(serde_json::to_value(summary).unwrap_or(Value::Null)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

fn extract_code_and_state(url: &str) -> Option<(String, String)> {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or(url);
    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        let value = urlencoding::decode(value).ok()?.into_owned();
        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            _ => {}
        }
    }
    Some((code?, state?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn recent_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let entries = state.logs.recent_logs(query.limit.unwrap_or(100)).await;
    Json(json!({ "logs": entries })).into_response()
}

async fn log_detail(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.logs.get_detail(id).await {
        Some(entry) => Json(json!(entry)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "log entry not found" }))).into_response(),
    }
}

async fn clear_logs(State(state): State<AppState>) -> Response {
    match state.logs.clear().await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn usage_summary(State(state): State<AppState>) -> Response {
    let totals = state.logs.usage_summary().await;
    Json(json!({ "usage": totals })).into_response()
}
