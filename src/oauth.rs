//! Authorization code flow with PKCE against the provider's OAuth2 endpoints.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::callback::CallbackListener;
use crate::config::OAuthSettings;
use crate::error::{AuthError, AuthResult};
use crate::pkce::{generate_code_challenge, generate_code_verifier, generate_state};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const EXPIRY_SKEW_SECONDS: i64 = 60;

pub type BrowserLauncher = Arc<dyn Fn(&str) + Send + Sync>;
/// `(code, code_verifier) -> token`
pub type TokenExchanger = Arc<dyn Fn(&str, &str) -> AuthResult<OAuthToken> + Send + Sync>;

/// Field names follow the token files written by earlier releases, so a
/// legacy `token.json` deserializes as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// A missing or zero-time expiry means the token never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) if expiry.timestamp() > 0 => {
                expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECONDS) <= now
            }
            _ => false,
        }
    }

    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh_token: Option<&str>) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: self
                .refresh_token
                .filter(|value| !value.is_empty())
                .or_else(|| previous_refresh_token.map(str::to_string)),
            expiry: self
                .expires_in
                .filter(|seconds| *seconds > 0)
                .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds)),
            scope: self.scope,
        }
    }
}

pub fn build_authorization_url(
    settings: &OAuthSettings,
    challenge: &str,
    state: &str,
) -> AuthResult<String> {
    let scope = settings.scope();
    let url = Url::parse_with_params(
        &settings.auth_url,
        [
            ("client_id", settings.client_id.as_str()),
            ("redirect_uri", settings.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
            ("prompt", "consent"),
        ],
    )
    .map_err(|err| {
        AuthError::Credentials(format!(
            "invalid authorization endpoint {}: {}",
            settings.auth_url, err
        ))
    })?;
    Ok(url.into())
}

pub struct Authenticator {
    settings: OAuthSettings,
    browser_launcher: BrowserLauncher,
    token_exchanger: TokenExchanger,
}

impl Authenticator {
    pub fn new(settings: OAuthSettings) -> Self {
        let exchange_settings = settings.clone();
        let token_exchanger: TokenExchanger = Arc::new(move |code, verifier| {
            default_token_exchange(&exchange_settings, code, verifier)
        });
        Self::with_clients(settings, Arc::new(open_browser), token_exchanger)
    }

    pub fn with_clients(
        settings: OAuthSettings,
        browser_launcher: BrowserLauncher,
        token_exchanger: TokenExchanger,
    ) -> Self {
        Self {
            settings,
            browser_launcher,
            token_exchanger,
        }
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Runs the whole browser flow and returns the exchanged token. Nothing is
    /// written to disk; persisting is up to the caller.
    pub fn authenticate(&self) -> AuthResult<OAuthToken> {
        let verifier = generate_code_verifier()?;
        let challenge = generate_code_challenge(&verifier);
        let state = generate_state()?;
        let auth_url = build_authorization_url(&self.settings, &challenge, &state)?;

        let listener = CallbackListener::bind(&self.settings.callback_addr)?;

        eprintln!("Opening browser for authentication...");
        eprintln!(
            "If the browser does not open, visit this URL:\n{}\n",
            auth_url
        );
        (self.browser_launcher)(&auth_url);

        let code = listener.wait_for_code(
            &state,
            self.settings.timeout,
            self.settings.shutdown_grace,
        )?;
        info!("authorization code received; exchanging for token");

        (self.token_exchanger)(&code, &verifier)
    }
}

/// Fire-and-forget: a missing opener only means the user copies the URL.
pub fn open_browser(url: &str) {
    let (program, arguments): (&str, Vec<&str>) = if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else if cfg!(target_os = "windows") {
        ("rundll32", vec!["url.dll,FileProtocolHandler", url])
    } else {
        ("xdg-open", vec![url])
    };

    let spawned = ProcessCommand::new(program)
        .args(&arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(err) = spawned {
        debug!(program, error = %err, "could not launch browser");
    }
}

pub(crate) fn http_client() -> AuthResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| AuthError::Http(format!("failed to build HTTP client: {}", err)))
}

pub fn default_token_exchange(
    settings: &OAuthSettings,
    code: &str,
    verifier: &str,
) -> AuthResult<OAuthToken> {
    let client = http_client()?;
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", verifier),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", settings.client_secret.as_str()),
        ("redirect_uri", settings.redirect_uri.as_str()),
    ];
    let response = client
        .post(&settings.token_url)
        .form(&params)
        .send()
        .map_err(|err| AuthError::Exchange(err.to_string()))?;

    let token = parse_token_response(response, None).map_err(AuthError::Exchange)?;
    debug!(
        has_refresh_token = token.usable_refresh_token().is_some(),
        "token exchange succeeded"
    );
    Ok(token)
}

/// `refresh_token` grant. The provider may omit a new refresh token, in which
/// case the current one is kept.
pub fn refresh_access_token(
    settings: &OAuthSettings,
    refresh_token: &str,
) -> AuthResult<OAuthToken> {
    let client = http_client()?;
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", settings.client_id.as_str()),
        ("client_secret", settings.client_secret.as_str()),
    ];
    let response = client
        .post(&settings.token_url)
        .form(&params)
        .send()
        .map_err(|err| AuthError::Http(format!("failed to refresh token: {}", err)))?;

    parse_token_response(response, Some(refresh_token)).map_err(|message| {
        AuthError::Http(format!(
            "failed to refresh token: {}. Run 'gsuite login' to re-authenticate",
            message
        ))
    })
}

fn parse_token_response(
    response: reqwest::blocking::Response,
    previous_refresh_token: Option<&str>,
) -> Result<OAuthToken, String> {
    let status = response.status();
    let text = response
        .text()
        .map_err(|err| format!("failed to read token response: {}", err))?;
    if !status.is_success() {
        return Err(format!(
            "token endpoint returned {}: {}",
            status.as_u16(),
            truncate_chars(&text, 200)
        ));
    }

    serde_json::from_str::<TokenResponse>(&text)
        .map(|payload| payload.into_token(previous_refresh_token))
        .map_err(|err| format!("token response is not valid JSON: {}", err))
}

pub(crate) fn truncate_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect::<String>()
}
