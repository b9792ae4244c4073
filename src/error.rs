use std::time::Duration;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Credentials(String),

    #[error("failed to generate random bytes: {0}")]
    Entropy(String),

    #[error("state mismatch in authentication callback")]
    StateMismatch,

    #[error("no authorization code in callback")]
    MissingCode,

    #[error("{0}")]
    Listener(String),

    #[error("timed out waiting for authentication callback (timeout: {}s)", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to exchange authorization code for token: {0}")]
    Exchange(String),

    #[error("no OAuth2 token found for {identity}. Run 'gsuite login' to authenticate")]
    TokenNotFound { identity: String },

    #[error("{0}")]
    Storage(String),

    #[error("{0}")]
    Account(String),

    #[error("migration: {0}")]
    Migration(String),

    #[error("{0}")]
    Http(String),

    #[error("{message}")]
    Api { status: u16, message: String },
}

impl AuthError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn account(message: impl Into<String>) -> Self {
        Self::Account(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TokenNotFound { .. })
    }

    /// Flow errors end the current login attempt; the user re-runs `gsuite login`.
    pub fn is_flow_error(&self) -> bool {
        matches!(
            self,
            Self::StateMismatch
                | Self::MissingCode
                | Self::Listener(_)
                | Self::Timeout(_)
                | Self::Exchange(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_errors_display_with_prefix() {
        let error = AuthError::Migration("failed to load legacy token".to_string());
        assert_eq!(error.to_string(), "migration: failed to load legacy token");
    }

    #[test]
    fn token_not_found_names_login_remedy() {
        let error = AuthError::TokenNotFound {
            identity: "alice@example.com".to_string(),
        };
        assert!(error.is_not_found());
        assert!(error.to_string().contains("gsuite login"));
    }

    #[test]
    fn timeout_reports_whole_seconds() {
        let error = AuthError::Timeout(Duration::from_secs(120));
        assert!(error.to_string().contains("120s"));
        assert!(error.is_flow_error());
    }
}
