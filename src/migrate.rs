//! One-time upgrade from the single `token.json` layout to per-account tokens.
//!
//! Ordering is what makes this crash-safe: the legacy file is renamed only
//! after the per-account token and the account store are both on disk, so an
//! interrupted run leaves `token.json` in place and the next invocation simply
//! migrates again.

use tracing::{debug, info};

use crate::accounts::AccountStore;
use crate::error::{AuthError, AuthResult};
use crate::oauth::OAuthToken;
use crate::token_store::TokenStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The account store already lists at least one account.
    AlreadyMigrated,
    /// No legacy token on disk.
    NothingToMigrate,
    Migrated { identity: String },
}

/// `discover_identity` receives the legacy token and returns the email that
/// owns it, typically via a profile request made with that token.
pub fn migrate_if_needed<F>(
    token_store: &TokenStore,
    account_store: &AccountStore,
    discover_identity: F,
) -> AuthResult<MigrationOutcome>
where
    F: Fn(&OAuthToken) -> AuthResult<String>,
{
    let mut snapshot = account_store
        .load()
        .map_err(|err| migration_error("failed to load account store", err))?;
    if !snapshot.is_empty() {
        return Ok(MigrationOutcome::AlreadyMigrated);
    }

    if !token_store.has_legacy_token() {
        return Ok(MigrationOutcome::NothingToMigrate);
    }
    info!(path = %token_store.legacy_token_path().display(), "migrating legacy token");

    let token = token_store
        .load_legacy_token()
        .map_err(|err| migration_error("failed to load legacy token", err))?;

    let identity = discover_identity(&token)
        .map_err(|err| migration_error("failed to discover email from legacy token", err))?;
    if identity.trim().is_empty() {
        return Err(AuthError::Migration(
            "profile lookup returned an empty email for legacy token".to_string(),
        ));
    }

    token_store
        .save_token_for(&identity, &token)
        .map_err(|err| {
            migration_error(
                &format!("failed to save per-account token for {}", identity),
                err,
            )
        })?;

    snapshot
        .add_account(&identity)
        .map_err(|err| migration_error(&format!("failed to add account {}", identity), err))?;
    account_store
        .save(&snapshot)
        .map_err(|err| migration_error("failed to save account store", err))?;

    let backup = token_store
        .backup_legacy_token()
        .map_err(|err| migration_error("failed to retire legacy token", err))?;
    debug!(backup = %backup.display(), "legacy token renamed");
    info!(identity = %identity, "legacy token migrated");

    Ok(MigrationOutcome::Migrated { identity })
}

fn migration_error(what: &str, err: AuthError) -> AuthError {
    match err {
        AuthError::Migration(message) => AuthError::Migration(format!("{}: {}", what, message)),
        other => AuthError::Migration(format!("{}: {}", what, other)),
    }
}
