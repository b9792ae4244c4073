use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::storage::write_file_atomic;

const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub email: String,
    pub added_at: DateTime<Utc>,
}

/// Known identities plus the `active` pointer. `active` may be empty; see
/// [`AccountsSnapshot::get_active`] for how that is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsSnapshot {
    #[serde(default)]
    pub active: String,
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
}

impl AccountsSnapshot {
    /// Appends `email` unless it is already known (case-insensitive) and
    /// makes it active either way, so a re-login doubles as a switch.
    pub fn add_account(&mut self, email: &str) -> AuthResult<()> {
        if email.is_empty() {
            return Err(AuthError::account("email cannot be empty"));
        }

        if !self.has_account(email) {
            self.accounts.push(AccountEntry {
                email: email.to_string(),
                added_at: Utc::now(),
            });
        }
        self.active = email.to_string();
        Ok(())
    }

    pub fn remove_account(&mut self, email: &str) -> AuthResult<()> {
        if email.is_empty() {
            return Err(AuthError::account("email cannot be empty"));
        }

        let index = self
            .accounts
            .iter()
            .position(|entry| entry.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| AuthError::account(format!("account {} not found", email)))?;
        self.accounts.remove(index);

        if self.active.eq_ignore_ascii_case(email) {
            self.active = self
                .accounts
                .first()
                .map(|entry| entry.email.clone())
                .unwrap_or_default();
        }
        Ok(())
    }

    pub fn set_active(&mut self, email: &str) -> AuthResult<()> {
        if email.is_empty() {
            return Err(AuthError::account("email cannot be empty"));
        }
        if !self.has_account(email) {
            return Err(AuthError::account(format!("account {} not found", email)));
        }
        self.active = email.to_string();
        Ok(())
    }

    /// A single stored account is used even when `active` was never set.
    /// With several accounts and no `active`, the caller has to pick one.
    pub fn get_active(&self) -> AuthResult<String> {
        if !self.active.is_empty() {
            return Ok(self.active.clone());
        }

        match self.accounts.as_slice() {
            [] => Err(AuthError::account(
                "no accounts configured. Run 'gsuite login' first",
            )),
            [only] => Ok(only.email.clone()),
            _ => Err(AuthError::account(
                "multiple accounts found but none is active. Use 'gsuite accounts switch' to set one",
            )),
        }
    }

    pub fn has_account(&self, email: &str) -> bool {
        self.accounts
            .iter()
            .any(|entry| entry.email.eq_ignore_ascii_case(email))
    }

    pub fn is_active(&self, email: &str) -> bool {
        !self.active.is_empty() && self.active.eq_ignore_ascii_case(email)
    }

    pub fn list(&self) -> Vec<AccountEntry> {
        self.accounts.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Reads and writes `<root>/accounts.json`. Every call goes to disk; there is
/// no cache to invalidate.
#[derive(Debug, Clone)]
pub struct AccountStore {
    root_dir: PathBuf,
}

impl AccountStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    pub fn file_path(&self) -> PathBuf {
        self.root_dir.join(ACCOUNTS_FILE)
    }

    pub fn load(&self) -> AuthResult<AccountsSnapshot> {
        let file_path = self.file_path();
        let data = match fs::read(&file_path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(AccountsSnapshot::default())
            }
            Err(err) => {
                return Err(AuthError::storage(format!(
                    "failed to read accounts file {}: {}",
                    file_path.display(),
                    err
                )))
            }
        };

        serde_json::from_slice::<AccountsSnapshot>(&data).map_err(|err| {
            AuthError::storage(format!(
                "failed to parse accounts file {}: {}",
                file_path.display(),
                err
            ))
        })
    }

    pub fn save(&self, snapshot: &AccountsSnapshot) -> AuthResult<()> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(|err| {
            AuthError::storage(format!("failed to encode account store: {}", err))
        })?;
        write_file_atomic(&self.file_path(), &data)?;
        debug!(
            accounts = snapshot.accounts.len(),
            active = %snapshot.active,
            "saved account store"
        );
        Ok(())
    }
}
