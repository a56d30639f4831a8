//! API-key gating for the `/v1/*` surface (spec §6) and the opaque
//! panel-session capability (spec §3 `PanelSession`) the admin routes accept
//! as their authorization token.
//!
//! Both live in `gravgate-core` rather than the HTTP framing layer because
//! the matching rules (which headers carry a key, which paths require one)
//! are part of the core's documented contract, not routing-table detail.

use std::collections::HashMap;
use std::sync::RwLock;

use gravgate_common::now_ms;

use crate::error::GatewayError;

/// Header names accepted for the client API key, in lookup order. Matching
/// is case-insensitive; callers are expected to have lower-cased header
/// names before calling `extract_api_key`.
const API_KEY_HEADERS: &[&str] = ["x-api-key", "api-key", "x-api_key", "api_key"].as_slice();

/// `true` for any path matching `^/(?:[\w-]+/)?v1/` — the plain `/v1/...`
/// surface and the per-credential `/{credential}/v1/...` surface — plus the
/// `/v1beta/...` Gemini `generateContent` surface, which the spec's §6
/// surface table lists as requiring a key even though its own verbatim
/// regex (written for the OpenAI/Anthropic routes) doesn't match it.
pub fn requires_api_key(path: &str) -> bool {
    let path = path.strip_prefix('/').unwrap_or(path);
    if is_versioned_api_segment(path, "v1") || is_versioned_api_segment(path, "v1beta") {
        return true;
    }
    let Some(slash) = path.find('/') else {
        return false;
    };
    let (segment, rest) = path.split_at(slash);
    if segment.is_empty() || !segment.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return false;
    }
    let rest = rest.trim_start_matches('/');
    is_versioned_api_segment(rest, "v1") || is_versioned_api_segment(rest, "v1beta")
}

/// `true` when `path` starts with the literal `segment/` (trailing slash
/// required, matching the spec's own `v1/` regex literal).
fn is_versioned_api_segment(path: &str, segment: &str) -> bool {
    path.starts_with(&format!("{segment}/"))
}

/// Extracts the client-presented API key from `Authorization: Bearer …`,
/// a bare `Authorization` header, or any of `x-api-key` / `api-key` /
/// `x-api_key` / `api_key` (case-insensitive).
pub fn extract_api_key<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> Option<String> {
    let mut by_name: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        by_name.insert(name.to_ascii_lowercase(), value.to_string());
    }
    if let Some(auth) = by_name.get("authorization") {
        let auth = auth.trim();
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        } else if !auth.is_empty() {
            return Some(auth.to_string());
        }
    }
    for header in API_KEY_HEADERS {
        if let Some(value) = by_name.get(*header) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Missing configuration is a 503; a mismatch is a 401.
pub fn check_api_key(configured: &str, presented: Option<&str>) -> Result<(), GatewayError> {
    if configured.is_empty() {
        return Err(GatewayError::UpstreamOther {
            status: 503,
            message: "API key is not configured".to_string(),
        });
    }
    match presented {
        Some(key) if key == configured => Ok(()),
        Some(_) => Err(GatewayError::AuthInvalid),
        None => Err(GatewayError::AuthMissing),
    }
}

const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Opaque token → expiry, the authorization capability the panel-only
/// routes (account management, log clearing) accept. Authentication and
/// CSRF handling themselves are peripheral (spec §1 Non-goals); this store
/// only tracks which issued tokens are still live.
#[derive(Default)]
pub struct PanelSessionStore {
    sessions: RwLock<HashMap<String, i64>>,
}

impl PanelSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let expiry = now_ms() + SESSION_TTL_MS;
        self.sessions
            .write()
            .expect("panel session lock poisoned")
            .insert(token.clone(), expiry);
        token
    }

    pub fn validate(&self, token: &str) -> bool {
        let guard = self.sessions.read().expect("panel session lock poisoned");
        matches!(guard.get(token), Some(expiry) if *expiry > now_ms())
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .write()
            .expect("panel session lock poisoned")
            .remove(token);
    }

    /// Drops every expired entry; call this opportunistically rather than on
    /// a timer since the map is small and short-lived by construction.
    pub fn sweep_expired(&self) {
        let now = now_ms();
        self.sessions
            .write()
            .expect("panel session lock poisoned")
            .retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key_matches_plain_and_credential_scoped_paths() {
        assert!(requires_api_key("/v1/chat/completions"));
        assert!(requires_api_key("/my-cred/v1/chat/completions"));
        assert!(!requires_api_key("/admin/logs"));
        assert!(!requires_api_key("/auth/accounts"));
        assert!(!requires_api_key("/v2/chat/completions"));
    }

    #[test]
    fn requires_api_key_also_gates_the_gemini_v1beta_surface() {
        assert!(requires_api_key(
            "/v1beta/models/gemini-2.5-flash:generateContent"
        ));
        assert!(!requires_api_key("/v1betainvalid/models"));
    }

    #[test]
    fn extract_api_key_prefers_bearer_then_falls_back_to_named_headers() {
        let headers = [("authorization", "Bearer secret-key")];
        assert_eq!(
            extract_api_key(headers.into_iter()),
            Some("secret-key".to_string())
        );

        let headers = [("x-api-key", "other-key")];
        assert_eq!(
            extract_api_key(headers.into_iter()),
            Some("other-key".to_string())
        );

        let headers: [(&str, &str); 0] = [];
        assert_eq!(extract_api_key(headers.into_iter()), None);
    }

    #[test]
    fn check_api_key_distinguishes_missing_from_mismatch() {
        assert!(check_api_key("configured", Some("configured")).is_ok());
        assert!(matches!(
            check_api_key("configured", Some("wrong")),
            Err(GatewayError::AuthInvalid)
        ));
        assert!(matches!(
            check_api_key("configured", None),
            Err(GatewayError::AuthMissing)
        ));
    }

    #[test]
    fn panel_sessions_validate_until_revoked() {
        let store = PanelSessionStore::new();
        let token = store.issue();
        assert!(store.validate(&token));
        store.revoke(&token);
        assert!(!store.validate(&token));
    }
}
