use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AuthError, AuthResult};
use crate::storage::default_config_dir;

pub const GOOGLE_AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_PROFILE_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users/me/profile";
pub const REDIRECT_URI: &str = "http://localhost:8089/callback";
/// IPv4 loopback only. Browsers that resolve `localhost` to `::1` fall back to
/// `127.0.0.1` when the IPv6 connect is refused, and binding loopback keeps the
/// callback off other interfaces.
pub const CALLBACK_ADDR: &str = "127.0.0.1:8089";
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(120);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const CREDENTIALS_JSON_ENV: &str = "GOOGLE_CREDENTIALS";
const CREDENTIALS_PATH_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Everything a command needs to find state on disk and pick an account.
/// Built once from CLI flags and handed to the service factory.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub config_dir: PathBuf,
    pub account: Option<String>,
    pub credentials_file: Option<PathBuf>,
}

impl AuthConfig {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            account: None,
            credentials_file: None,
        }
    }

    pub fn from_defaults(account: Option<String>, credentials_file: Option<PathBuf>) -> Self {
        Self {
            config_dir: default_config_dir(),
            account: account.filter(|value| !value.trim().is_empty()),
            credentials_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct ClientSection {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

impl ClientCredentials {
    /// Resolution order: explicit file, `GOOGLE_CREDENTIALS` (raw JSON),
    /// `GOOGLE_APPLICATION_CREDENTIALS` (path).
    pub fn load(credentials_file: Option<&Path>) -> AuthResult<Self> {
        let data = load_credentials_json(
            credentials_file,
            non_empty_env(CREDENTIALS_JSON_ENV),
            non_empty_env(CREDENTIALS_PATH_ENV),
        )?;
        Self::from_json(&data)
    }

    /// Accepts the Google client JSON in either its `installed` or `web` shape.
    pub fn from_json(data: &[u8]) -> AuthResult<Self> {
        let root: Value = serde_json::from_slice(data).map_err(|err| {
            AuthError::Credentials(format!("failed to parse credentials JSON: {}", err))
        })?;
        let section = root
            .get("installed")
            .or_else(|| root.get("web"))
            .ok_or_else(|| {
                AuthError::Credentials(
                    "credentials JSON has neither \"installed\" nor \"web\" key".to_string(),
                )
            })?;
        let client: ClientSection = serde_json::from_value(section.clone()).map_err(|err| {
            AuthError::Credentials(format!("failed to parse client credentials: {}", err))
        })?;
        if client.client_id.is_empty() {
            return Err(AuthError::Credentials(
                "client_id is empty in credentials JSON".to_string(),
            ));
        }

        Ok(Self {
            client_id: client.client_id,
            client_secret: client.client_secret,
        })
    }
}

fn load_credentials_json(
    credentials_file: Option<&Path>,
    env_json: Option<String>,
    env_path: Option<String>,
) -> AuthResult<Vec<u8>> {
    if let Some(path) = credentials_file {
        return fs::read(path).map_err(|err| {
            AuthError::Credentials(format!(
                "failed to read credentials file {}: {}",
                path.display(),
                err
            ))
        });
    }
    if let Some(json) = env_json {
        return Ok(json.into_bytes());
    }
    if let Some(path) = env_path {
        return fs::read(&path).map_err(|err| {
            AuthError::Credentials(format!(
                "failed to read {} file {}: {}",
                CREDENTIALS_PATH_ENV, path, err
            ))
        });
    }
    Err(AuthError::Credentials(format!(
        "no credentials found: set --credentials-file, {} (JSON) or {} (file path)",
        CREDENTIALS_JSON_ENV, CREDENTIALS_PATH_ENV
    )))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub redirect_uri: String,
    pub callback_addr: String,
    pub scopes: Vec<String>,
    pub timeout: Duration,
    pub shutdown_grace: Duration,
}

impl OAuthSettings {
    /// Google endpoints; `GSUITE_AUTH_URL`, `GSUITE_TOKEN_URL` and
    /// `GSUITE_PROFILE_URL` override them.
    pub fn google(credentials: ClientCredentials) -> Self {
        Self {
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            auth_url: non_empty_env("GSUITE_AUTH_URL")
                .unwrap_or_else(|| GOOGLE_AUTH_ENDPOINT.to_string()),
            token_url: non_empty_env("GSUITE_TOKEN_URL")
                .unwrap_or_else(|| GOOGLE_TOKEN_ENDPOINT.to_string()),
            profile_url: non_empty_env("GSUITE_PROFILE_URL")
                .unwrap_or_else(|| GMAIL_PROFILE_ENDPOINT.to_string()),
            redirect_uri: REDIRECT_URI.to_string(),
            callback_addr: CALLBACK_ADDR.to_string(),
            scopes: vec![GMAIL_MODIFY_SCOPE.to_string(), CALENDAR_SCOPE.to_string()],
            timeout: AUTH_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_JSON: &str = r#"{"installed":{"client_id":"test","client_secret":"shh"}}"#;

    #[test]
    fn from_json_parses_installed_and_web_shapes() {
        let installed = ClientCredentials::from_json(
            br#"{"installed":{"client_id":"id123","client_secret":"sec456"}}"#,
        )
        .expect("installed");
        assert_eq!(installed.client_id, "id123");
        assert_eq!(installed.client_secret, "sec456");

        let web = ClientCredentials::from_json(
            br#"{"web":{"client_id":"webid","client_secret":"websec"}}"#,
        )
        .expect("web");
        assert_eq!(web.client_id, "webid");
    }

    #[test]
    fn from_json_allows_empty_secret() {
        let credentials =
            ClientCredentials::from_json(br#"{"installed":{"client_id":"id","client_secret":""}}"#)
                .expect("credentials");
        assert_eq!(credentials.client_secret, "");
    }

    #[test]
    fn from_json_rejects_bad_shapes() {
        let cases: [(&[u8], &str); 3] = [
            (br#"{"other":{}}"#, "neither"),
            (br#"{"installed":{"client_id":"","client_secret":"s"}}"#, "client_id is empty"),
            (b"not json", "parse"),
        ];
        for (data, expected) in cases {
            let err = ClientCredentials::from_json(data).expect_err("invalid credentials");
            assert!(
                err.to_string().contains(expected),
                "{} should mention {}",
                err,
                expected
            );
        }
    }

    #[test]
    fn explicit_file_wins_over_environment() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("creds.json");
        fs::write(&path, TEST_JSON).expect("write creds");

        let data = load_credentials_json(
            Some(&path),
            Some(r#"{"installed":{"client_id":"env"}}"#.to_string()),
            None,
        )
        .expect("load");
        assert_eq!(data, TEST_JSON.as_bytes());
    }

    #[test]
    fn json_env_wins_over_path_env() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("creds.json");
        fs::write(&path, r#"{"installed":{"client_id":"file"}}"#).expect("write creds");

        let data = load_credentials_json(
            None,
            Some(TEST_JSON.to_string()),
            Some(path.display().to_string()),
        )
        .expect("load");
        assert_eq!(data, TEST_JSON.as_bytes());
    }

    #[test]
    fn path_env_is_read_when_json_env_missing() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("creds.json");
        fs::write(&path, TEST_JSON).expect("write creds");

        let data = load_credentials_json(None, None, Some(path.display().to_string()))
            .expect("load");
        assert_eq!(data, TEST_JSON.as_bytes());
    }

    #[test]
    fn missing_sources_and_missing_file_are_credentials_errors() {
        let err = load_credentials_json(None, None, None).expect_err("nothing configured");
        assert!(matches!(err, AuthError::Credentials(_)));
        assert!(err.to_string().contains("GOOGLE_CREDENTIALS"));

        let err = load_credentials_json(None, None, Some("/nonexistent/path/creds.json".into()))
            .expect_err("missing file");
        assert!(matches!(err, AuthError::Credentials(_)));
    }

    #[test]
    fn google_settings_use_fixed_loopback_redirect() {
        let settings = OAuthSettings::google(ClientCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        });
        assert_eq!(settings.redirect_uri, "http://localhost:8089/callback");
        assert_eq!(settings.callback_addr, "127.0.0.1:8089");
        let addr: std::net::SocketAddr = settings.callback_addr.parse().expect("socket addr");
        assert!(addr.ip().is_loopback());
        let redirect = url::Url::parse(&settings.redirect_uri).expect("redirect uri");
        assert_eq!(redirect.port(), Some(addr.port()));
        assert_eq!(settings.timeout, Duration::from_secs(120));
        assert!(settings.scope().contains("gmail.modify"));
    }
}
