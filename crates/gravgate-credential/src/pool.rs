//! The central concurrency object: selection, hourly quota, refresh-on-
//! expiry, and mark-bad. See `Acquire` for the selection algorithm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use gravgate_common::now_ms;
use gravgate_storage::LogStore;

use crate::error::PoolError;
use crate::model::{Credential, CredentialView};
use crate::oauth::OAuthClient;
use crate::store::{CredentialStore, ImportOptions};

const WINDOW_MS: i64 = 60 * 60 * 1000;

pub struct Outcome {
    pub success: bool,
    pub model: String,
}

/// Result of `CredentialPool::import`, per the admin `import-toml` route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Result of `CredentialPool::refresh_all`, the best-effort bulk refresh.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RefreshAllSummary {
    pub refreshed: usize,
    pub failed: usize,
}

pub struct CredentialPool {
    store: CredentialStore,
    oauth: OAuthClient,
    usage: Arc<LogStore>,
    credentials: RwLock<Vec<Credential>>,
    last_used_at: RwLock<HashMap<String, i64>>,
    refresh_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    hourly_limit: AtomicU32,
    session_counter: AtomicU64,
}

impl CredentialPool {
    pub async fn initialize(
        store: CredentialStore,
        oauth: OAuthClient,
        usage: Arc<LogStore>,
        hourly_limit: u32,
    ) -> Result<Self, PoolError> {
        let credentials = store.load().await?;
        Ok(Self {
            store,
            oauth,
            usage,
            credentials: RwLock::new(credentials),
            last_used_at: RwLock::new(HashMap::new()),
            refresh_locks: RwLock::new(HashMap::new()),
            hourly_limit: AtomicU32::new(hourly_limit),
            session_counter: AtomicU64::new(0),
        })
    }

    pub fn set_hourly_limit(&self, limit: u32) {
        self.hourly_limit.store(limit, Ordering::Relaxed);
    }

    pub async fn reload(&self) -> Result<(), PoolError> {
        let fresh = self.store.load().await?;
        *self.credentials.write().await = fresh;
        Ok(())
    }

    pub async fn acquire(&self) -> Result<CredentialView, PoolError> {
        let candidate_count = self.credentials.read().await.len();
        for _ in 0..candidate_count.max(1) {
            let usage = self.usage.usage_within_window(WINDOW_MS).await;
            let last_used = self.last_used_at.read().await.clone();
            let limit = self.hourly_limit.load(Ordering::Relaxed) as u64;

            let chosen_index = {
                let guard = self.credentials.read().await;
                pick_index(&guard, &usage, &last_used, limit)
            };
            let Some(index) = chosen_index else {
                return Err(PoolError::NoCredentialAvailable);
            };

            match self.ensure_fresh_and_view(index).await? {
                Some(view) => return Ok(view),
                None => continue,
            }
        }
        Err(PoolError::NoCredentialAvailable)
    }

    pub async fn acquire_by_project_id(
        &self,
        project_id: &str,
    ) -> Result<CredentialView, PoolError> {
        let index = {
            let guard = self.credentials.read().await;
            guard
                .iter()
                .position(|c| c.project_id.as_deref() == Some(project_id) && c.enabled)
                .ok_or(PoolError::CredentialNotFound)?
        };
        let usage = self.usage.usage_within_window(WINDOW_MS).await;
        let (success, failed) = usage.get(project_id).copied().unwrap_or((0, 0));
        let limit = self.hourly_limit.load(Ordering::Relaxed) as u64;
        if success + failed >= limit {
            return Err(PoolError::NoCredentialAvailable);
        }
        self.ensure_fresh_and_view(index)
            .await?
            .ok_or(PoolError::CredentialNotFound)
    }

    /// Refreshes the candidate at `index` if it isn't fresh enough,
    /// collapsing concurrent refreshes of the same credential into one
    /// upstream call. Returns `None` (caller should retry selection) when
    /// the candidate turned out to be terminally disabled.
    async fn ensure_fresh_and_view(&self, index: usize) -> Result<Option<CredentialView>, PoolError> {
        let refresh_token = {
            let guard = self.credentials.read().await;
            let Some(cred) = guard.get(index) else {
                return Ok(None);
            };
            if cred.is_fresh_enough() {
                let project_id = cred.project_id.clone().unwrap_or_default();
                let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
                let view = cred.to_view(session_id);
                drop(guard);
                self.last_used_at
                    .write()
                    .await
                    .insert(project_id, now_ms());
                return Ok(Some(view));
            }
            cred.refresh_token.clone()
        };

        let lock = {
            let mut locks = self.refresh_locks.write().await;
            locks
                .entry(refresh_token.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Re-check: another acquirer may have refreshed while we waited.
        {
            let guard = self.credentials.read().await;
            if let Some(cred) = guard.get(index)
                && cred.refresh_token == refresh_token
                && cred.is_fresh_enough()
            {
                let project_id = cred.project_id.clone().unwrap_or_default();
                let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
                let view = cred.to_view(session_id);
                drop(guard);
                self.last_used_at
                    .write()
                    .await
                    .insert(project_id, now_ms());
                return Ok(Some(view));
            }
        }

        match self.oauth.refresh(&refresh_token).await {
            Ok(tokens) => {
                let mut guard = self.credentials.write().await;
                let Some(cred) = guard.get_mut(index) else {
                    return Ok(None);
                };
                cred.apply_refresh(tokens.access_token, tokens.expires_in);
                let project_id = cred.project_id.clone().unwrap_or_default();
                let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
                let view = cred.to_view(session_id);
                let list = guard.clone();
                drop(guard);
                self.store.save(&list).await?;
                self.last_used_at
                    .write()
                    .await
                    .insert(project_id, now_ms());
                Ok(Some(view))
            }
            Err(crate::oauth::OAuthError::RefreshTerminal(message)) => {
                warn!(%refresh_token, %message, "disabling credential after terminal refresh failure");
                let mut guard = self.credentials.write().await;
                if let Some(cred) = guard.get_mut(index) {
                    cred.enabled = false;
                }
                let list = guard.clone();
                drop(guard);
                self.store.save(&list).await?;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Increments in-memory counters; persistence is the Usage Store's job
    /// via the orchestrator's log append.
    pub async fn record_outcome(&self, project_id: &str, _outcome: Outcome) {
        self.last_used_at
            .write()
            .await
            .insert(project_id.to_string(), now_ms());
    }

    pub async fn enumerate(&self) -> Vec<Credential> {
        self.credentials.read().await.clone()
    }

    pub async fn replace_at(&self, index: usize, record: Credential) -> Result<(), PoolError> {
        let mut guard = self.credentials.write().await;
        self.store.replace_at(&mut guard, index, record).await?;
        Ok(())
    }

    pub async fn remove_at(&self, index: usize) -> Result<(), PoolError> {
        let mut guard = self.credentials.write().await;
        self.store.remove_at(&mut guard, index).await?;
        Ok(())
    }

    pub async fn set_enabled(&self, index: usize, enabled: bool) -> Result<(), PoolError> {
        let mut guard = self.credentials.write().await;
        self.store.set_enabled(&mut guard, index, enabled).await?;
        Ok(())
    }

    /// Exposes the OAuth client for the handful of admin routes (auth-url
    /// build, callback exchange) that don't go through selection.
    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    /// Merges already-normalized `records` into the persisted list per
    /// `opts` and reloads the in-memory view. `imported` counts the incoming
    /// records actually merged in (after `filter_disabled` drops); `skipped`
    /// counts what that filter dropped.
    pub async fn import(&self, records: Vec<Credential>, opts: ImportOptions) -> Result<ImportSummary, PoolError> {
        let total_incoming = records.len();
        let skipped = if opts.filter_disabled {
            records.iter().filter(|c| !c.enabled).count()
        } else {
            0
        };
        let existing = self.credentials.read().await.clone();
        let merged = CredentialStore::merge(existing, records, &opts);
        self.store.save(&merged).await?;
        let total = merged.len();
        *self.credentials.write().await = merged;
        Ok(ImportSummary { imported: total_incoming - skipped, skipped, total })
    }

    /// Forces a refresh of the credential at `index` regardless of its
    /// current freshness, for the single-credential admin refresh route.
    pub async fn refresh_at(&self, index: usize) -> Result<(), PoolError> {
        let refresh_token = {
            let guard = self.credentials.read().await;
            guard.get(index).ok_or(PoolError::CredentialNotFound)?.refresh_token.clone()
        };
        let tokens = self.oauth.refresh(&refresh_token).await?;
        let mut guard = self.credentials.write().await;
        let cred = guard.get_mut(index).ok_or(PoolError::CredentialNotFound)?;
        cred.apply_refresh(tokens.access_token, tokens.expires_in);
        let list = guard.clone();
        drop(guard);
        self.store.save(&list).await?;
        Ok(())
    }

    /// Best-effort bulk refresh of every enabled credential; a terminal
    /// failure disables that credential instead of aborting the sweep.
    pub async fn refresh_all(&self) -> RefreshAllSummary {
        let indices: Vec<usize> = self
            .credentials
            .read()
            .await
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(i, _)| i)
            .collect();
        let mut summary = RefreshAllSummary::default();
        for index in indices {
            match self.refresh_at(index).await {
                Ok(()) => summary.refreshed += 1,
                Err(PoolError::Oauth(crate::oauth::OAuthError::RefreshTerminal(_))) => {
                    let mut guard = self.credentials.write().await;
                    if let Some(cred) = guard.get_mut(index) {
                        cred.enabled = false;
                    }
                    let list = guard.clone();
                    drop(guard);
                    let _ = self.store.save(&list).await;
                    summary.failed += 1;
                }
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Re-resolves the project id for the credential at `index`; a prior
    /// `project_id` is never silently overwritten.
    pub async fn resolve_project_id_at(&self, index: usize, allow_random: bool) -> Result<String, PoolError> {
        let access_token = {
            let guard = self.credentials.read().await;
            let cred = guard.get(index).ok_or(PoolError::CredentialNotFound)?;
            cred.access_token.clone().ok_or(PoolError::CredentialNotFound)?
        };
        let project_id = self.oauth.resolve_project_id(&access_token, allow_random).await?;
        let mut guard = self.credentials.write().await;
        let cred = guard.get_mut(index).ok_or(PoolError::CredentialNotFound)?;
        cred.set_project_id_if_absent(project_id.clone());
        let list = guard.clone();
        drop(guard);
        self.store.save(&list).await?;
        Ok(project_id)
    }
}

fn pick_index(
    credentials: &[Credential],
    usage: &HashMap<String, (u64, u64)>,
    last_used: &HashMap<String, i64>,
    hourly_limit: u64,
) -> Option<usize> {
    credentials
        .iter()
        .enumerate()
        .filter(|(_, c)| c.enabled)
        .filter(|(_, c)| {
            let project_id = c.project_id.as_deref().unwrap_or_default();
            let (success, failed) = usage.get(project_id).copied().unwrap_or((0, 0));
            success + failed < hourly_limit
        })
        .min_by_key(|(i, c)| {
            let project_id = c.project_id.as_deref().unwrap_or_default();
            let (success, failed) = usage.get(project_id).copied().unwrap_or((0, 0));
            let requests = success + failed;
            let last_used_at = last_used.get(project_id).copied().unwrap_or(0);
            (requests, last_used_at, *i)
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(project_id: &str) -> Credential {
        let mut cred = Credential::new(format!("rt-{project_id}"));
        cred.project_id = Some(project_id.to_string());
        cred.access_token = Some("token".to_string());
        cred.issued_at = Some(now_ms());
        cred.expires_in = Some(3600);
        cred
    }

    #[test]
    fn picks_fewest_requests_then_lru_then_position() {
        let creds = vec![credential("a"), credential("b"), credential("c")];
        let mut usage = HashMap::new();
        usage.insert("a".to_string(), (5, 0));
        usage.insert("b".to_string(), (2, 0));
        usage.insert("c".to_string(), (2, 0));
        let mut last_used = HashMap::new();
        last_used.insert("b".to_string(), 100);
        last_used.insert("c".to_string(), 50);

        let picked = pick_index(&creds, &usage, &last_used, 100);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn filters_out_credentials_over_hourly_limit() {
        let creds = vec![credential("a"), credential("b")];
        let mut usage = HashMap::new();
        usage.insert("a".to_string(), (10, 0));
        usage.insert("b".to_string(), (1, 0));
        let picked = pick_index(&creds, &usage, &HashMap::new(), 5);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn no_eligible_candidate_returns_none() {
        let creds = vec![credential("a")];
        let mut usage = HashMap::new();
        usage.insert("a".to_string(), (10, 0));
        assert_eq!(pick_index(&creds, &usage, &HashMap::new(), 5), None);
    }

    async fn test_pool(dir: &std::path::Path, existing: Vec<Credential>) -> CredentialPool {
        let store = CredentialStore::new(dir.join("credentials.json"));
        store.save(&existing).await.unwrap();
        let logs = Arc::new(
            gravgate_storage::LogStore::load(dir.join("logs.json"), 1000, 30)
                .await
                .unwrap(),
        );
        let oauth = OAuthClient::new(reqwest::Client::new());
        CredentialPool::initialize(store, oauth, logs, 100).await.unwrap()
    }

    #[tokio::test]
    async fn import_reports_imported_skipped_and_total_matching_disk() {
        let dir = std::env::temp_dir().join(format!("gravgate-pool-import-{}", now_ms()));
        let pool = test_pool(&dir, vec![credential("existing")]).await;

        let mut disabled = Credential::new("rt-disabled");
        disabled.enabled = false;
        let incoming = vec![Credential::new("rt-new-1"), disabled];

        let summary = pool
            .import(incoming, ImportOptions { replace_existing: false, filter_disabled: true })
            .await
            .unwrap();
        assert_eq!(summary, ImportSummary { imported: 1, skipped: 1, total: 2 });
        assert_eq!(pool.enumerate().await.len(), 2);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
