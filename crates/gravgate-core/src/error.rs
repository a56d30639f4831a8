//! The gateway-wide error taxonomy (spec §7): every error the Orchestrator
//! can surface to a client, with its HTTP status and JSON body. Component
//! errors (`CredentialError`, `StorageError`, `OAuthError`, ...) funnel into
//! this enum at the Orchestrator boundary.

use serde_json::{Value, json};

use gravgate_credential::{OAuthError, PoolError};
use gravgate_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("missing api key")]
    AuthMissing,
    #[error("invalid api key")]
    AuthInvalid,
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential not found")]
    CredentialNotFound,
    #[error("auth exchange failed: {0}")]
    AuthExchangeFailed(String),
    #[error("project id could not be resolved")]
    ProjectIdMissing,
    #[error("upstream error (transient): {0}")]
    UpstreamTransient(String),
    #[error("upstream rejected the credential: {0}")]
    UpstreamTerminalForCredential(String),
    #[error("upstream error: {message}")]
    UpstreamOther { status: u16, message: String },
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),
}

impl GatewayError {
    /// HTTP status per the mapping in spec §7.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::AuthMissing => 401,
            GatewayError::AuthInvalid => 401,
            GatewayError::NoCredentialAvailable => 503,
            GatewayError::CredentialNotFound => 404,
            GatewayError::AuthExchangeFailed(_) => 500,
            GatewayError::ProjectIdMissing => 400,
            GatewayError::UpstreamTransient(_) => 503,
            GatewayError::UpstreamTerminalForCredential(_) => 503,
            GatewayError::UpstreamOther { status, .. } => {
                if *status == 0 {
                    500
                } else {
                    *status
                }
            }
            GatewayError::StorageCorrupt(_) => 500,
        }
    }

    /// `{error: {message, type}}`, the JSON body surfaced to clients.
    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        })
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::AuthMissing => "auth_missing",
            GatewayError::AuthInvalid => "auth_invalid",
            GatewayError::NoCredentialAvailable => "no_credential_available",
            GatewayError::CredentialNotFound => "credential_not_found",
            GatewayError::AuthExchangeFailed(_) => "auth_exchange_failed",
            GatewayError::ProjectIdMissing => "project_id_missing",
            GatewayError::UpstreamTransient(_) => "upstream_transient",
            GatewayError::UpstreamTerminalForCredential(_) => "upstream_terminal",
            GatewayError::UpstreamOther { .. } => "upstream_error",
            GatewayError::StorageCorrupt(_) => "storage_corrupt",
        }
    }
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoCredentialAvailable => GatewayError::NoCredentialAvailable,
            PoolError::CredentialNotFound => GatewayError::CredentialNotFound,
            PoolError::Oauth(oauth_err) => oauth_err.into(),
            PoolError::Store(store_err) => GatewayError::StorageCorrupt(store_err.to_string()),
        }
    }
}

impl From<OAuthError> for GatewayError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::ExchangeFailed(message) => GatewayError::AuthExchangeFailed(message),
            OAuthError::RefreshTerminal(message) => {
                GatewayError::UpstreamTerminalForCredential(message)
            }
            OAuthError::RefreshTransient(message) => GatewayError::UpstreamTransient(message),
            OAuthError::ProjectIdMissing => GatewayError::ProjectIdMissing,
            OAuthError::Request(request_err) => GatewayError::UpstreamTransient(request_err.to_string()),
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::StorageCorrupt(err.to_string())
    }
}
