use std::sync::Arc;
use tracing::{debug, info};

use crate::accounts::{AccountStore, AccountsSnapshot};
use crate::client::{fetch_profile, AuthenticatedClient, Profile, ProfileLookup, TokenRefresher};
use crate::config::{AuthConfig, ClientCredentials, OAuthSettings, GMAIL_PROFILE_ENDPOINT};
use crate::error::{AuthError, AuthResult};
use crate::migrate::{migrate_if_needed, MigrationOutcome};
use crate::oauth::{refresh_access_token, Authenticator};
use crate::token_store::TokenStore;

/// Resolves "which account" and "which token" for every command and hands
/// back a ready client. Stateless between calls: every lookup re-reads disk.
pub struct ServiceFactory {
    account_hint: Option<String>,
    token_store: TokenStore,
    account_store: AccountStore,
    settings: Result<OAuthSettings, String>,
    refresher: Result<TokenRefresher, String>,
    profile_lookup: ProfileLookup,
}

impl ServiceFactory {
    pub fn new(config: &AuthConfig) -> Self {
        let settings = ClientCredentials::load(config.credentials_file.as_deref())
            .map(OAuthSettings::google)
            .map_err(|err| err.to_string());

        let refresher = settings.clone().map(|settings| {
            let refresher: TokenRefresher = Arc::new(move |refresh_token| {
                refresh_access_token(&settings, refresh_token)
            });
            refresher
        });
        let profile_url = settings
            .as_ref()
            .map(|settings| settings.profile_url.clone())
            .unwrap_or_else(|_| GMAIL_PROFILE_ENDPOINT.to_string());
        let profile_lookup: ProfileLookup =
            Arc::new(move |client| fetch_profile(client, &profile_url));

        Self::with_clients(config, settings, refresher, profile_lookup)
    }

    pub fn with_clients(
        config: &AuthConfig,
        settings: Result<OAuthSettings, String>,
        refresher: Result<TokenRefresher, String>,
        profile_lookup: ProfileLookup,
    ) -> Self {
        Self {
            account_hint: config.account.clone(),
            token_store: TokenStore::new(config.config_dir.clone()),
            account_store: AccountStore::new(config.config_dir.clone()),
            settings,
            refresher,
            profile_lookup,
        }
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    pub fn account_store(&self) -> &AccountStore {
        &self.account_store
    }

    pub fn settings(&self) -> AuthResult<&OAuthSettings> {
        self.settings
            .as_ref()
            .map_err(|message| AuthError::Credentials(message.clone()))
    }

    fn refresher(&self) -> AuthResult<TokenRefresher> {
        self.refresher
            .as_ref()
            .map(Arc::clone)
            .map_err(|message| AuthError::Credentials(message.clone()))
    }

    /// Skipped when no client credentials are configured: a tool that was
    /// never set up has nothing worth migrating yet.
    pub fn ensure_migrated(&self) -> AuthResult<MigrationOutcome> {
        let Ok(refresher) = self.refresher() else {
            debug!("no client credentials configured; skipping migration");
            return Ok(MigrationOutcome::NothingToMigrate);
        };

        migrate_if_needed(&self.token_store, &self.account_store, |token| {
            let client = AuthenticatedClient::new("", token.clone(), Arc::clone(&refresher))?;
            (self.profile_lookup)(&client).map(|profile| profile.email_address)
        })
    }

    /// Explicit identity first, then the account store's active account.
    pub fn resolve_identity(&self, explicit: Option<&str>) -> AuthResult<String> {
        if let Some(identity) = explicit.filter(|value| !value.trim().is_empty()) {
            return Ok(identity.to_string());
        }
        self.account_store.load()?.get_active()
    }

    /// The configured `--account` hint, else the active account.
    pub fn client(&self) -> AuthResult<AuthenticatedClient> {
        self.client_for(self.account_hint.as_deref())
    }

    pub fn client_for(&self, identity: Option<&str>) -> AuthResult<AuthenticatedClient> {
        self.ensure_migrated()?;
        let refresher = self.refresher()?;
        let identity = self.resolve_identity(identity)?;
        let token = self.token_store.load_token_for(&identity)?;
        debug!(identity = %identity, "resolved authenticated client");
        AuthenticatedClient::new(identity, token, refresher)
    }

    pub fn profile(&self, client: &AuthenticatedClient) -> AuthResult<Profile> {
        (self.profile_lookup)(client)
    }

    /// Browser login: discover who signed in, store their token and make them
    /// the active account.
    pub fn login(&self, authenticator: &Authenticator) -> AuthResult<String> {
        let token = authenticator.authenticate()?;
        let client = AuthenticatedClient::new("", token.clone(), self.refresher()?)?;
        let email = self.profile(&client)?.email_address;
        if email.trim().is_empty() {
            return Err(AuthError::Http(
                "failed to get user profile: empty email address".to_string(),
            ));
        }

        self.token_store.save_token_for(&email, &token)?;
        let mut snapshot = self.account_store.load()?;
        snapshot.add_account(&email)?;
        self.account_store.save(&snapshot)?;
        info!(email = %email, "login complete");
        Ok(email)
    }

    pub fn list_accounts(&self) -> AuthResult<AccountsSnapshot> {
        self.ensure_migrated()?;
        self.account_store.load()
    }

    /// Activates the entry matching `email` under its stored spelling, since
    /// that spelling names the token file.
    pub fn switch_account(&self, email: &str) -> AuthResult<String> {
        self.ensure_migrated()?;
        let mut snapshot = self.account_store.load()?;
        let stored = stored_spelling(&snapshot, email);
        snapshot.set_active(&stored)?;
        self.account_store.save(&snapshot)?;
        Ok(stored)
    }

    /// Drops the account entry and its token file. The file is looked up under
    /// the spelling recorded at login, which may differ in case from `email`.
    pub fn remove_account(&self, email: &str) -> AuthResult<()> {
        self.ensure_migrated()?;
        let mut snapshot = self.account_store.load()?;
        let stored = stored_spelling(&snapshot, email);

        snapshot.remove_account(email)?;
        self.account_store.save(&snapshot)?;
        self.token_store.delete_token_for(&stored)?;
        info!(email = %stored, "account removed");
        Ok(())
    }

    /// Removes the `--account` hint or, failing that, the active account.
    pub fn logout(&self) -> AuthResult<String> {
        self.ensure_migrated()?;
        let identity = self.resolve_identity(self.account_hint.as_deref())?;
        self.remove_account(&identity)?;
        Ok(identity)
    }
}

fn stored_spelling(snapshot: &AccountsSnapshot, email: &str) -> String {
    snapshot
        .accounts
        .iter()
        .find(|entry| entry.email.eq_ignore_ascii_case(email))
        .map(|entry| entry.email.clone())
        .unwrap_or_else(|| email.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{OAuthToken, TokenExchanger};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;
    use url::Url;

    fn token(access: &str) -> OAuthToken {
        OAuthToken {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some(format!("rt-{}", access)),
            expiry: None,
            scope: None,
        }
    }

    fn test_settings() -> OAuthSettings {
        OAuthSettings::google(ClientCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        })
    }

    fn no_refresh() -> TokenRefresher {
        Arc::new(|_| Err(AuthError::Http("refresh should not run".to_string())))
    }

    /// Profile lookup that maps access tokens to emails like
    /// `at-alice` -> `alice@example.com`.
    fn profile_from_token() -> ProfileLookup {
        Arc::new(|client| {
            let access = client.access_token()?;
            let user = access.trim_start_matches("at-");
            Ok(Profile {
                email_address: format!("{}@example.com", user),
                messages_total: 3,
                threads_total: 2,
            })
        })
    }

    fn factory(config_dir: PathBuf, account: Option<&str>) -> ServiceFactory {
        let mut config = AuthConfig::new(config_dir);
        config.account = account.map(str::to_string);
        ServiceFactory::with_clients(
            &config,
            Ok(test_settings()),
            Ok(no_refresh()),
            profile_from_token(),
        )
    }

    fn seed_account(factory: &ServiceFactory, email: &str, access: &str) {
        factory
            .token_store()
            .save_token_for(email, &token(access))
            .expect("save token");
        let mut snapshot = factory.account_store().load().expect("load");
        snapshot.add_account(email).expect("add");
        factory.account_store().save(&snapshot).expect("save");
    }

    #[test]
    fn client_uses_active_account_token() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        seed_account(&factory, "alice@example.com", "at-alice");
        seed_account(&factory, "bob@example.com", "at-bob");

        let client = factory.client().expect("client");
        assert_eq!(client.identity(), "bob@example.com");
        assert_eq!(client.access_token().expect("token"), "at-bob");
    }

    #[test]
    fn explicit_account_hint_wins_over_active() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), Some("alice@example.com"));
        seed_account(&factory, "alice@example.com", "at-alice");
        seed_account(&factory, "bob@example.com", "at-bob");

        let client = factory.client().expect("client");
        assert_eq!(client.identity(), "alice@example.com");
    }

    #[test]
    fn missing_token_for_known_account_is_not_found() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        let mut snapshot = factory.account_store().load().expect("load");
        snapshot.add_account("ghost@example.com").expect("add");
        factory.account_store().save(&snapshot).expect("save");

        let err = factory.client().err().expect("no token");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("gsuite login"));
    }

    #[test]
    fn no_accounts_asks_for_login() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);

        let err = factory.client().err().expect("no accounts");
        assert!(err.to_string().contains("gsuite login"));
    }

    #[test]
    fn client_runs_migration_before_resolving_identity() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        factory
            .token_store()
            .save_legacy_token(&token("at-legacy"))
            .expect("seed legacy");

        let client = factory.client().expect("client after migration");

        assert_eq!(client.identity(), "legacy@example.com");
        assert!(!factory.token_store().has_legacy_token());
        assert!(factory.token_store().legacy_backup_path().exists());
    }

    #[test]
    fn migration_failure_surfaces_with_prefix_and_keeps_legacy_file() {
        let temp = TempDir::new().expect("temp dir");
        let config = AuthConfig::new(temp.path().to_path_buf());
        let factory = ServiceFactory::with_clients(
            &config,
            Ok(test_settings()),
            Ok(no_refresh()),
            Arc::new(|_| Err(AuthError::Http("profile endpoint unreachable".to_string()))),
        );
        factory
            .token_store()
            .save_legacy_token(&token("at-legacy"))
            .expect("seed legacy");

        let err = factory.client().err().expect("migration failure");

        assert!(err.to_string().starts_with("migration:"));
        assert!(factory.token_store().has_legacy_token());
    }

    #[test]
    fn missing_credentials_skip_migration_but_fail_client() {
        let temp = TempDir::new().expect("temp dir");
        let config = AuthConfig::new(temp.path().to_path_buf());
        let factory = ServiceFactory::with_clients(
            &config,
            Err("no credentials found".to_string()),
            Err("no credentials found".to_string()),
            profile_from_token(),
        );
        factory
            .token_store()
            .save_legacy_token(&token("at-legacy"))
            .expect("seed legacy");

        assert_eq!(
            factory.ensure_migrated().expect("skipped"),
            MigrationOutcome::NothingToMigrate
        );
        assert!(factory.token_store().has_legacy_token());
        let err = factory.client().err().expect("credentials required");
        assert!(matches!(err, AuthError::Credentials(_)));
    }

    #[test]
    fn switch_and_remove_keep_store_consistent() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        seed_account(&factory, "a@example.com", "at-a");
        seed_account(&factory, "b@example.com", "at-b");

        assert_eq!(
            factory.switch_account("A@EXAMPLE.COM").expect("switch"),
            "a@example.com"
        );
        assert_eq!(
            factory.client().expect("client").access_token().expect("token"),
            "at-a"
        );
        assert!(factory.switch_account("ghost@example.com").is_err());
        factory.remove_account("A@example.com").expect("remove");

        let snapshot = factory.list_accounts().expect("list");
        assert_eq!(snapshot.active, "b@example.com");
        assert_eq!(snapshot.accounts.len(), 1);
        assert!(factory
            .token_store()
            .load_token_for("a@example.com")
            .expect_err("token deleted")
            .is_not_found());
    }

    #[test]
    fn logout_removes_active_account() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        seed_account(&factory, "solo@example.com", "at-solo");

        let removed = factory.logout().expect("logout");

        assert_eq!(removed, "solo@example.com");
        let snapshot = factory.list_accounts().expect("list");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.active, "");
    }

    #[test]
    fn login_stores_token_and_activates_discovered_account() {
        let temp = TempDir::new().expect("temp dir");
        let factory = factory(temp.path().to_path_buf(), None);
        seed_account(&factory, "old@example.com", "at-old");

        let probe = TcpListener::bind("127.0.0.1:0").expect("probe");
        let mut settings = test_settings();
        settings.callback_addr = probe.local_addr().expect("addr").to_string();
        settings.redirect_uri = format!("http://{}/callback", settings.callback_addr);
        settings.timeout = Duration::from_secs(10);
        settings.shutdown_grace = Duration::from_secs(1);
        drop(probe);

        let exchanger: TokenExchanger = Arc::new(|code, _verifier| {
            assert_eq!(code, "the-code");
            Ok(token("at-new"))
        });
        let authenticator = Authenticator::with_clients(
            settings,
            Arc::new(|auth_url| {
                let url = Url::parse(auth_url).expect("auth url");
                let query: std::collections::HashMap<String, String> =
                    url.query_pairs().into_owned().collect();
                let callback = format!(
                    "{}?state={}&code=the-code",
                    query["redirect_uri"], query["state"]
                );
                thread::spawn(move || {
                    let _ = reqwest::blocking::get(&callback);
                });
            }),
            exchanger,
        );

        let email = factory.login(&authenticator).expect("login");

        assert_eq!(email, "new@example.com");
        let snapshot = factory.list_accounts().expect("list");
        assert_eq!(snapshot.active, "new@example.com");
        assert_eq!(snapshot.accounts.len(), 2);
        assert_eq!(
            factory
                .token_store()
                .load_token_for("new@example.com")
                .expect("stored")
                .access_token,
            "at-new"
        );
    }
}
