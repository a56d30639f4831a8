//! Shared application state handed to every axum handler: the orchestrator
//! plus the collaborators admin routes reach around it for (pool, logs,
//! panel sessions), and the static configuration a handful of routes need
//! directly (the API key, the panel credentials).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use gravgate_core::{PanelSessionStore, RequestOrchestrator};
use gravgate_credential::{CredentialPool, PkceChallenge};
use gravgate_storage::LogStore;

/// In-flight OAuth authorization-code flows, keyed by the `state` parameter
/// handed back on the callback URL so `parse-url` can recover the matching
/// PKCE verifier. Short-lived by construction (a flow either completes or is
/// abandoned within one browser round trip).
#[derive(Clone, Default)]
pub struct PendingOAuth {
    pub challenges: Arc<Mutex<HashMap<String, PkceChallenge>>>,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub pool: Arc<CredentialPool>,
    pub logs: Arc<LogStore>,
    pub panel_sessions: Arc<PanelSessionStore>,
    pub pending_oauth: PendingOAuth,
    pub api_key: String,
    pub panel_user: String,
    pub panel_password: String,
}
