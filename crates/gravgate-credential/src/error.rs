use thiserror::Error;

use crate::oauth::OAuthError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential not found")]
    CredentialNotFound,
    #[error(transparent)]
    Oauth(#[from] OAuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
