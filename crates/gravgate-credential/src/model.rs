use serde::{Deserialize, Serialize};

use gravgate_common::now_ms;

/// A persisted OAuth credential capable of calling the upstream on behalf of
/// one Google Cloud project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: i64,
}

fn default_enabled() -> bool {
    true
}

impl Credential {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            access_token: None,
            expires_in: None,
            issued_at: None,
            project_id: None,
            email: None,
            enabled: true,
            created_at: now_ms(),
        }
    }

    /// `issued_at + expires_in*1000 - now > 300_000ms`. A credential with no
    /// access token, or no recorded issue time, is never fresh enough.
    pub fn is_fresh_enough(&self) -> bool {
        let (Some(access_token), Some(issued_at), Some(expires_in)) =
            (self.access_token.as_ref(), self.issued_at, self.expires_in)
        else {
            return false;
        };
        if access_token.is_empty() {
            return false;
        }
        issued_at + expires_in * 1000 - now_ms() > 300_000
    }

    pub fn apply_refresh(&mut self, access_token: String, expires_in: i64) {
        self.access_token = Some(access_token);
        self.expires_in = Some(expires_in);
        self.issued_at = Some(now_ms());
    }

    /// `project_id` is set once and never silently overwritten.
    pub fn set_project_id_if_absent(&mut self, project_id: String) {
        if self.project_id.is_none() {
            self.project_id = Some(project_id);
        }
    }

    pub fn to_view(&self, session_id: u64) -> CredentialView {
        CredentialView {
            access_token: self.access_token.clone().unwrap_or_default(),
            project_id: self.project_id.clone().unwrap_or_default(),
            session_id,
            enabled: self.enabled,
        }
    }
}

/// A projection over [`Credential`] used by the selection algorithm and
/// passed to the Request Adapter. Never carries `refresh_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialView {
    pub access_token: String,
    pub project_id: String,
    /// Per-process nonce identifying which in-memory slot produced this view.
    pub session_id: u64,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_credential_passes_the_300s_margin() {
        let mut cred = Credential::new("rt-1");
        cred.apply_refresh("at-1".into(), 3600);
        assert!(cred.is_fresh_enough());
    }

    #[test]
    fn credential_within_300s_of_expiry_is_not_fresh() {
        let mut cred = Credential::new("rt-1");
        cred.apply_refresh("at-1".into(), 3600);
        cred.issued_at = Some(now_ms() - 3600 * 1000 + 100_000);
        assert!(!cred.is_fresh_enough());
    }

    #[test]
    fn credential_with_no_access_token_is_never_fresh() {
        let cred = Credential::new("rt-1");
        assert!(!cred.is_fresh_enough());
    }

    #[test]
    fn project_id_is_set_once_and_never_overwritten() {
        let mut cred = Credential::new("rt-1");
        cred.set_project_id_if_absent("proj-a".into());
        cred.set_project_id_if_absent("proj-b".into());
        assert_eq!(cred.project_id.as_deref(), Some("proj-a"));
    }

    #[test]
    fn view_never_carries_the_refresh_token() {
        let mut cred = Credential::new("rt-secret");
        cred.apply_refresh("at-1".into(), 3600);
        cred.set_project_id_if_absent("proj-a".into());
        let view = cred.to_view(7);
        assert_eq!(view.access_token, "at-1");
        assert_eq!(view.project_id, "proj-a");
        assert_eq!(view.session_id, 7);
        let serialized = serde_json::to_string(&view).unwrap();
        assert!(!serialized.contains("rt-secret"));
    }
}
