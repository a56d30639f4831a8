//! Credential lifecycle: persisted OAuth records, the Google OAuth client,
//! and the selection pool that load-balances requests across them under
//! hourly-quota pressure.

pub mod error;
pub mod model;
pub mod oauth;
pub mod pool;
pub mod store;

pub use error::PoolError;
pub use model::{Credential, CredentialView};
pub use oauth::{OAuthClient, OAuthError, PkceChallenge, TokenResponse, generate_pkce_challenge};
pub use pool::{CredentialPool, ImportSummary, Outcome, RefreshAllSummary};
pub use store::{CredentialStore, ImportOptions, StoreError};
