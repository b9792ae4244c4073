use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::oauth::OAuthToken;
use crate::storage::write_file_atomic;

const TOKENS_DIR: &str = "tokens";
const LEGACY_TOKEN_FILE: &str = "token.json";
const LEGACY_BACKUP_SUFFIX: &str = ".bak";

/// One JSON token file per identity under `<root>/tokens/`, plus the
/// pre-multi-account `<root>/token.json` that only migration touches.
#[derive(Debug, Clone)]
pub struct TokenStore {
    root_dir: PathBuf,
}

impl TokenStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    /// The identity is used verbatim; `Alice@x.com` and `alice@x.com` map to
    /// different files even though account matching ignores case. Identities
    /// that could leave `tokens/` are rejected.
    pub fn token_path_for(&self, identity: &str) -> AuthResult<PathBuf> {
        if identity.is_empty() {
            return Err(AuthError::account("email cannot be empty"));
        }
        if identity.contains(['/', '\\', '\0']) || identity.contains("..") {
            return Err(AuthError::account(format!(
                "invalid account name: {}",
                identity
            )));
        }
        Ok(self
            .root_dir
            .join(TOKENS_DIR)
            .join(format!("{}.json", identity)))
    }

    pub fn save_token_for(&self, identity: &str, token: &OAuthToken) -> AuthResult<()> {
        let path = self.token_path_for(identity)?;
        write_token(&path, token)?;
        debug!(identity, path = %path.display(), "saved token");
        Ok(())
    }

    pub fn load_token_for(&self, identity: &str) -> AuthResult<OAuthToken> {
        let path = self.token_path_for(identity)?;
        read_token(&path)?.ok_or_else(|| AuthError::TokenNotFound {
            identity: identity.to_string(),
        })
    }

    pub fn delete_token_for(&self, identity: &str) -> AuthResult<()> {
        let path = self.token_path_for(identity)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(identity, "deleted token");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::storage(format!(
                "failed to remove token file {}: {}",
                path.display(),
                err
            ))),
        }
    }

    pub fn legacy_token_path(&self) -> PathBuf {
        self.root_dir.join(LEGACY_TOKEN_FILE)
    }

    pub fn legacy_backup_path(&self) -> PathBuf {
        self.root_dir
            .join(format!("{}{}", LEGACY_TOKEN_FILE, LEGACY_BACKUP_SUFFIX))
    }

    pub fn has_legacy_token(&self) -> bool {
        self.legacy_token_path().is_file()
    }

    pub fn save_legacy_token(&self, token: &OAuthToken) -> AuthResult<()> {
        write_token(&self.legacy_token_path(), token)
    }

    pub fn load_legacy_token(&self) -> AuthResult<OAuthToken> {
        let path = self.legacy_token_path();
        read_token(&path)?.ok_or_else(|| {
            AuthError::storage(format!("legacy token file not found: {}", path.display()))
        })
    }

    /// Renames `token.json` to `token.json.bak`; the bytes stay recoverable.
    pub fn backup_legacy_token(&self) -> AuthResult<PathBuf> {
        let source = self.legacy_token_path();
        let backup = self.legacy_backup_path();
        fs::rename(&source, &backup).map_err(|err| {
            AuthError::storage(format!(
                "failed to rename legacy token to {}: {}",
                backup.display(),
                err
            ))
        })?;
        Ok(backup)
    }
}

fn write_token(path: &Path, token: &OAuthToken) -> AuthResult<()> {
    let data = serde_json::to_vec_pretty(token)
        .map_err(|err| AuthError::storage(format!("failed to encode token: {}", err)))?;
    write_file_atomic(path, &data)
}

/// `Ok(None)` when the file does not exist.
fn read_token(path: &Path) -> AuthResult<Option<OAuthToken>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AuthError::storage(format!(
                "failed to read token file {}: {}",
                path.display(),
                err
            )))
        }
    };
    serde_json::from_slice::<OAuthToken>(&data)
        .map(Some)
        .map_err(|err| {
            AuthError::storage(format!(
                "failed to parse token file {}: {}",
                path.display(),
                err
            ))
        })
}
