use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{AuthError, AuthResult};
use crate::oauth::{http_client, truncate_chars, OAuthToken};

/// `refresh_token -> fresh token`
pub type TokenRefresher = Arc<dyn Fn(&str) -> AuthResult<OAuthToken> + Send + Sync>;
pub type ProfileLookup = Arc<dyn Fn(&AuthenticatedClient) -> AuthResult<Profile> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    #[serde(default)]
    pub messages_total: i64,
    #[serde(default)]
    pub threads_total: i64,
}

/// HTTP client bound to one identity's token. Expired access tokens are
/// refreshed in memory before each request; the copy on disk is left alone
/// until the next login.
pub struct AuthenticatedClient {
    identity: String,
    http: reqwest::blocking::Client,
    token: Mutex<OAuthToken>,
    refresher: TokenRefresher,
}

impl AuthenticatedClient {
    pub fn new(
        identity: impl Into<String>,
        token: OAuthToken,
        refresher: TokenRefresher,
    ) -> AuthResult<Self> {
        Ok(Self {
            identity: identity.into(),
            http: http_client()?,
            token: Mutex::new(token),
            refresher,
        })
    }

    /// Empty when the owner is not known yet (legacy migration).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn token(&self) -> AuthResult<OAuthToken> {
        self.token
            .lock()
            .map(|token| token.clone())
            .map_err(|_| AuthError::Http("token lock poisoned".to_string()))
    }

    pub fn access_token(&self) -> AuthResult<String> {
        let mut token = self
            .token
            .lock()
            .map_err(|_| AuthError::Http("token lock poisoned".to_string()))?;
        if !token.is_expired(Utc::now()) {
            return Ok(token.access_token.clone());
        }

        let refresh_token = token.usable_refresh_token().ok_or_else(|| {
            AuthError::Http(
                "access token expired and no refresh token is stored. Run 'gsuite login' to re-authenticate"
                    .to_string(),
            )
        })?;
        let refreshed = (self.refresher)(refresh_token)?;
        info!(identity = %self.identity, "refreshed expired access token");
        *token = refreshed;
        Ok(token.access_token.clone())
    }

    /// GET `url` with bearer auth; non-2xx responses go through
    /// [`describe_api_failure`] with `context` naming the operation.
    pub fn get_json(&self, url: &str, context: &str) -> AuthResult<Value> {
        let access_token = self.access_token()?;
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(access_token)
            .send()
            .map_err(|err| AuthError::Http(format!("{}: {}", context, err)))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| AuthError::Http(format!("{}: failed to read response: {}", context, err)))?;
        debug!(status = status.as_u16(), url, "API response");

        if !status.is_success() {
            return Err(describe_api_failure(status.as_u16(), &text, context));
        }
        serde_json::from_str::<Value>(&text)
            .map_err(|err| AuthError::Http(format!("{}: response is not JSON: {}", context, err)))
    }
}

pub fn fetch_profile(client: &AuthenticatedClient, profile_url: &str) -> AuthResult<Profile> {
    let root = client.get_json(profile_url, "failed to get user profile")?;
    serde_json::from_value::<Profile>(root).map_err(|err| {
        AuthError::Http(format!("failed to get user profile: unexpected response: {}", err))
    })
}

/// Turns a provider error status into a message that names the remedy.
pub fn describe_api_failure(status: u16, body: &str, context: &str) -> AuthError {
    let message = match status {
        401 => format!(
            "{}: authentication expired or revoked. Run 'gsuite login' to re-authenticate",
            context
        ),
        403 if is_insufficient_scope(body) => format!(
            "{}: the token is missing a required permission (e.g. calendar permission). \
             Run 'gsuite login' again to grant access",
            context
        ),
        404 => format!("{}: not found", context),
        _ => format!("{}: {} {}", context, status, truncate_chars(body.trim(), 200)),
    };
    AuthError::Api { status, message }
}

fn is_insufficient_scope(body: &str) -> bool {
    let Ok(root) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let Some(error) = root.get("error") else {
        return false;
    };

    let reason_matches = error
        .get("errors")
        .and_then(Value::as_array)
        .map(|items| {
            items.iter().any(|item| {
                item.get("reason").and_then(Value::as_str) == Some("insufficientPermissions")
            })
        })
        .unwrap_or(false);
    let detail_matches = error
        .get("details")
        .and_then(Value::as_array)
        .map(|items| {
            items.iter().any(|item| {
                item.get("reason").and_then(Value::as_str)
                    == Some("ACCESS_TOKEN_SCOPE_INSUFFICIENT")
            })
        })
        .unwrap_or(false);
    reason_matches || detail_matches
}
