//! OAuth2 authorization for the `gsuite` CLI: PKCE browser login over a
//! loopback callback, per-account token files, the account registry with its
//! active pointer, one-time migration from the single-token layout, and the
//! factory that turns all of that into an authenticated HTTP client.

pub mod accounts;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod migrate;
pub mod oauth;
pub mod pkce;
pub mod service;
pub mod storage;
pub mod token_store;

pub use accounts::{AccountEntry, AccountStore, AccountsSnapshot};
pub use client::{AuthenticatedClient, Profile};
pub use config::{AuthConfig, ClientCredentials, OAuthSettings};
pub use error::{AuthError, AuthResult};
pub use migrate::{migrate_if_needed, MigrationOutcome};
pub use oauth::{Authenticator, OAuthToken};
pub use service::ServiceFactory;
pub use token_store::TokenStore;
