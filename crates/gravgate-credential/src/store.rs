//! Durable on-disk representation of the credential list.

use thiserror::Error;

use gravgate_common::atomic_write;

use crate::model::Credential;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt credential store at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub replace_existing: bool,
    pub filter_disabled: bool,
}

pub struct CredentialStore {
    path: std::path::PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing file yields an empty list; malformed contents are a hard
    /// error so a corrupted store is never silently discarded.
    pub async fn load(&self) -> StoreResult<Vec<Credential>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.display().to_string(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, list: &[Credential]) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(list).expect("Credential always serializes");
        atomic_write(&self.path, &bytes).await?;
        Ok(())
    }

    /// Merges `incoming` into `existing` per the spec's merge policy and
    /// returns the resulting list; callers are responsible for `save`ing it.
    pub fn merge(
        existing: Vec<Credential>,
        mut incoming: Vec<Credential>,
        opts: &ImportOptions,
    ) -> Vec<Credential> {
        if opts.filter_disabled {
            incoming.retain(|c| c.enabled);
        }
        if opts.replace_existing {
            return incoming;
        }
        let mut merged = existing;
        for candidate in incoming {
            let existing_slot = merged.iter_mut().find(|c| {
                c.refresh_token == candidate.refresh_token
                    || (c.access_token.is_some() && c.access_token == candidate.access_token)
            });
            match existing_slot {
                Some(slot) => {
                    slot.access_token = candidate.access_token.or(slot.access_token.take());
                    slot.expires_in = candidate.expires_in.or(slot.expires_in);
                    slot.issued_at = candidate.issued_at.or(slot.issued_at);
                    if slot.project_id.is_none() {
                        slot.project_id = candidate.project_id;
                    }
                    slot.email = candidate.email.or(slot.email.take());
                    slot.enabled = candidate.enabled;
                }
                None => merged.push(candidate),
            }
        }
        merged
    }

    pub async fn replace_at(
        &self,
        list: &mut Vec<Credential>,
        index: usize,
        record: Credential,
    ) -> StoreResult<()> {
        if let Some(slot) = list.get_mut(index) {
            *slot = record;
        }
        self.save(list).await
    }

    pub async fn remove_at(&self, list: &mut Vec<Credential>, index: usize) -> StoreResult<()> {
        if index < list.len() {
            list.remove(index);
        }
        self.save(list).await
    }

    pub async fn set_enabled(
        &self,
        list: &mut Vec<Credential>,
        index: usize,
        enabled: bool,
    ) -> StoreResult<()> {
        if let Some(slot) = list.get_mut(index) {
            slot.enabled = enabled;
        }
        self.save(list).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(refresh_token: &str) -> Credential {
        Credential::new(refresh_token)
    }

    #[test]
    fn merge_overlays_matching_refresh_tokens() {
        let mut base = cred("rt-1");
        base.project_id = Some("proj-a".to_string());
        let mut incoming = cred("rt-1");
        incoming.access_token = Some("new-token".to_string());
        incoming.project_id = Some("should-not-overwrite".to_string());

        let merged = CredentialStore::merge(vec![base], vec![incoming], &ImportOptions::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].access_token.as_deref(), Some("new-token"));
        assert_eq!(merged[0].project_id.as_deref(), Some("proj-a"));
    }

    #[test]
    fn merge_appends_new_refresh_tokens() {
        let merged = CredentialStore::merge(
            vec![cred("rt-1")],
            vec![cred("rt-2")],
            &ImportOptions::default(),
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn replace_existing_discards_prior_list() {
        let merged = CredentialStore::merge(
            vec![cred("rt-1")],
            vec![cred("rt-2")],
            &ImportOptions {
                replace_existing: true,
                filter_disabled: false,
            },
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].refresh_token, "rt-2");
    }

    #[test]
    fn filter_disabled_drops_disabled_incoming_records() {
        let mut disabled = cred("rt-2");
        disabled.enabled = false;
        let merged = CredentialStore::merge(
            vec![cred("rt-1")],
            vec![disabled],
            &ImportOptions {
                replace_existing: false,
                filter_disabled: true,
            },
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].refresh_token, "rt-1");
    }
}
