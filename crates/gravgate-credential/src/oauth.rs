//! Google OAuth 2 client for the upstream's fixed first-party credentials:
//! PKCE authorization-code exchange, refresh, and project-id resolution.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const ANTIGRAVITY_USER_AGENT: &str = "antigravity/1.15.8 (Windows; AMD64)";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const RESOURCE_MANAGER_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";
const CLIENT_ID: &str = "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile https://www.googleapis.com/auth/cclog https://www.googleapis.com/auth/experimentsandconfigs";

pub type OAuthResult<T> = Result<T, OAuthError>;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("auth exchange failed: {0}")]
    ExchangeFailed(String),
    /// 400/403 from the token endpoint: the caller should disable the
    /// credential rather than retry.
    #[error("refresh rejected by upstream (terminal): {0}")]
    RefreshTerminal(String),
    #[error("refresh failed transiently: {0}")]
    RefreshTransient(String),
    #[error("project id could not be resolved")]
    ProjectIdMissing,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, serde::Deserialize)]
struct TokenWire {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// One PKCE challenge: `state` identifies the flow, `code_verifier` is kept
/// server-side and exchanged alongside the authorization code.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
}

pub fn generate_pkce_challenge() -> PkceChallenge {
    let mut bytes = [0u8; 32];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut bytes);
    let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

    rng.fill_bytes(&mut bytes);
    let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(code_verifier.as_bytes());
    let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);

    PkceChallenge {
        state,
        code_verifier,
        code_challenge,
    }
}

pub struct OAuthClient {
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn build_auth_url(&self, redirect_uri: &str, challenge: &PkceChallenge) -> String {
        let params = [
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", redirect_uri),
            ("scope", OAUTH_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("code_challenge_method", "S256"),
            ("code_challenge", challenge.code_challenge.as_str()),
            ("state", challenge.state.as_str()),
        ];
        let qs = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{DEFAULT_AUTH_URL}?{qs}")
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> OAuthResult<TokenResponse> {
        let body = format!(
            "code={}&client_id={}&client_secret={}&redirect_uri={}&code_verifier={}&grant_type=authorization_code",
            urlencoding::encode(code),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(code_verifier),
        );
        let wire = self
            .post_token(body, OAuthError::ExchangeFailed as fn(String) -> OAuthError)
            .await?;
        Ok(TokenResponse {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_in: wire.expires_in.unwrap_or(3600),
        })
    }

    /// Status 400/403 is terminal for the credential; everything else is
    /// transient and safe to retry with the same refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> OAuthResult<TokenResponse> {
        let body = format!(
            "refresh_token={}&client_id={}&client_secret={}&grant_type=refresh_token",
            urlencoding::encode(refresh_token),
            urlencoding::encode(CLIENT_ID),
            urlencoding::encode(CLIENT_SECRET),
        );
        let response = self
            .http
            .post(DEFAULT_TOKEN_URL)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).to_string();
            if status.as_u16() == 400 || status.as_u16() == 403 {
                return Err(OAuthError::RefreshTerminal(text));
            }
            return Err(OAuthError::RefreshTransient(text));
        }
        let wire: TokenWire = serde_json::from_slice(&bytes)
            .map_err(|err| OAuthError::RefreshTransient(err.to_string()))?;
        Ok(TokenResponse {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_in: wire.expires_in.unwrap_or(3600),
        })
    }

    async fn post_token(
        &self,
        body: String,
        on_error: fn(String) -> OAuthError,
    ) -> OAuthResult<TokenWire> {
        let response = self
            .http
            .post(DEFAULT_TOKEN_URL)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(on_error(String::from_utf8_lossy(&bytes).to_string()));
        }
        serde_json::from_slice(&bytes).map_err(|err| on_error(err.to_string()))
    }

    /// Resource-Manager lookup first, load-assist lookup second; with
    /// `allow_random`, falls back to a synthetic UUID-derived id instead of
    /// surfacing [`OAuthError::ProjectIdMissing`].
    pub async fn resolve_project_id(
        &self,
        access_token: &str,
        allow_random: bool,
    ) -> OAuthResult<String> {
        if let Some(project_id) = self.try_load_code_assist(access_token).await? {
            return Ok(project_id);
        }
        if let Some(project_id) = self.try_onboard_user(access_token).await? {
            return Ok(project_id);
        }
        if allow_random {
            return Ok(random_project_id());
        }
        Err(OAuthError::ProjectIdMissing)
    }

    async fn try_load_code_assist(&self, access_token: &str) -> OAuthResult<Option<String>> {
        let url = format!("{RESOURCE_MANAGER_URL}/v1internal:loadCodeAssist");
        let body = serde_json::json!({
            "metadata": {
                "ideType": "ANTIGRAVITY",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI"
            }
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .header("User-Agent", ANTIGRAVITY_USER_AGENT)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let payload: serde_json::Value = response.json().await?;
        if payload.get("currentTier").map(|v| v.is_null()).unwrap_or(true) {
            return Ok(None);
        }
        Ok(payload
            .get("cloudaicompanionProject")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    async fn try_onboard_user(&self, access_token: &str) -> OAuthResult<Option<String>> {
        let tier_id = self.onboard_tier(access_token).await?;
        let url = format!("{RESOURCE_MANAGER_URL}/v1internal:onboardUser");
        let body = serde_json::json!({
            "tierId": tier_id,
            "metadata": {
                "ideType": "ANTIGRAVITY",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI"
            }
        });
        for _ in 0..5 {
            let response = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .header("User-Agent", ANTIGRAVITY_USER_AGENT)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Ok(None);
            }
            let payload: serde_json::Value = response.json().await?;
            if payload.get("done").and_then(|v| v.as_bool()) == Some(true) {
                let project = payload.get("response").and_then(|v| v.get("cloudaicompanionProject"));
                let project_id = project
                    .and_then(|v| v.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| project.and_then(|v| v.as_str()).map(str::to_string));
                return Ok(project_id);
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
        Ok(None)
    }

    async fn onboard_tier(&self, access_token: &str) -> OAuthResult<String> {
        let url = format!("{RESOURCE_MANAGER_URL}/v1internal:loadCodeAssist");
        let body = serde_json::json!({
            "metadata": {
                "ideType": "ANTIGRAVITY",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI"
            }
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .header("User-Agent", ANTIGRAVITY_USER_AGENT)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok("LEGACY".to_string());
        }
        let payload: serde_json::Value = response.json().await?;
        let tiers = payload
            .get("allowedTiers")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for tier in tiers {
            if tier.get("isDefault").and_then(|v| v.as_bool()) == Some(true)
                && let Some(id) = tier.get("id").and_then(|v| v.as_str())
            {
                return Ok(id.to_string());
            }
        }
        Ok("LEGACY".to_string())
    }

    /// Best-effort; failure is non-fatal to the caller.
    pub async fn fetch_user_email(&self, access_token: &str) -> Option<String> {
        let response = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .header("User-Agent", ANTIGRAVITY_USER_AGENT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let payload: serde_json::Value = response.json().await.ok()?;
        payload
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

fn random_project_id() -> String {
    format!("gravgate-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_derives_from_a_distinct_verifier() {
        let challenge = generate_pkce_challenge();
        assert_ne!(challenge.state, challenge.code_verifier);
        assert_ne!(challenge.code_verifier, challenge.code_challenge);
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(challenge.code_verifier.as_bytes()));
        assert_eq!(challenge.code_challenge, expected);
    }

    #[test]
    fn successive_challenges_do_not_repeat() {
        let a = generate_pkce_challenge();
        let b = generate_pkce_challenge();
        assert_ne!(a.state, b.state);
        assert_ne!(a.code_verifier, b.code_verifier);
    }

    #[test]
    fn auth_url_carries_state_and_s256_challenge_method() {
        let client = OAuthClient::new(reqwest::Client::new());
        let challenge = generate_pkce_challenge();
        let url = client.build_auth_url("https://example.test/callback", &challenge);
        assert!(url.starts_with(DEFAULT_AUTH_URL));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", urlencoding::encode(&challenge.state))));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn random_project_id_is_namespaced_and_unique() {
        let a = random_project_id();
        let b = random_project_id();
        assert!(a.starts_with("gravgate-"));
        assert_ne!(a, b);
    }
}
