use crate::error::KeeperError;
use crate::types::provider::Provider;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

pub const GMAIL_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GMAIL_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_USERINFO_URI: &str = "https://openidconnect.googleapis.com/v1/userinfo";

pub const AIRTABLE_AUTH_URL: &str = "https://airtable.com/oauth2/v1/authorize";
pub const AIRTABLE_TOKEN_URI: &str = "https://airtable.com/oauth2/v1/token";
pub const AIRTABLE_WHOAMI_URI: &str = "https://api.airtable.com/v0/meta/whoami";

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "KEEPER_";

/// Top-level service configuration.
///
/// Layered as: built-in defaults, then `config.toml`, then `KEEPER_*`
/// environment variables (`KEEPER_REFRESH__SAFETY_MARGIN_SECS=600`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub basic: BasicConfig,
    pub refresh: RefreshConfig,
    pub providers: ProvidersConfig,
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub loglevel: String,
    /// Shared key required by every collaborator-facing route.
    pub keeper_key: String,
    /// At least 64 bytes; a random key is generated when absent.
    pub cookie_secret: Option<String>,
    pub insecure_cookie: bool,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            database_url: "sqlite:keeper.db".to_string(),
            loglevel: "info".to_string(),
            keeper_key: String::new(),
            cookie_secret: None,
            insecure_cookie: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Tokens expiring within this window are refreshed before being handed out.
    pub safety_margin_secs: i64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Extra attempts for transient token-endpoint failures; 0 disables retry.
    pub max_retries: usize,
    pub min_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Token-endpoint calls allowed per provider per minute.
    pub requests_per_minute: u32,
    /// Lifetime assumed when a provider omits `expires_in`.
    pub default_expires_in_secs: i64,
    pub proxy: Option<Url>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 300,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            max_retries: 2,
            min_retry_delay_ms: 500,
            max_retry_delay_ms: 3_000,
            requests_per_minute: 60,
            default_expires_in_secs: 3_600,
            proxy: None,
        }
    }
}

impl RefreshConfig {
    pub fn safety_margin(&self) -> Result<chrono::Duration, KeeperError> {
        seconds_setting("refresh.safety_margin_secs", self.safety_margin_secs.max(0))
    }

    pub fn default_expires_in(&self) -> Result<chrono::Duration, KeeperError> {
        seconds_setting(
            "refresh.default_expires_in_secs",
            self.default_expires_in_secs.max(1),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gmail: ProviderConfig,
    pub airtable: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            gmail: ProviderConfig::gmail(),
            airtable: ProviderConfig::airtable(),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::Gmail => &self.gmail,
            Provider::Airtable => &self.airtable,
        }
    }

    pub fn get_mut(&mut self, provider: Provider) -> &mut ProviderConfig {
        match provider {
            Provider::Gmail => &mut self.gmail,
            Provider::Airtable => &mut self.airtable,
        }
    }
}

/// How the client authenticates itself at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    RequestBody,
    BasicAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub auth_url: Url,
    pub token_url: Url,
    #[serde(default)]
    pub identity_url: Option<Url>,
    #[serde(default)]
    pub redirect_url: Option<Url>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub client_auth: ClientAuth,
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
    #[serde(default)]
    pub rotates_refresh_token: bool,
}

impl ProviderConfig {
    fn gmail() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: builtin_url(GMAIL_AUTH_URL),
            token_url: builtin_url(GMAIL_TOKEN_URI),
            identity_url: Some(builtin_url(GMAIL_USERINFO_URI)),
            redirect_url: None,
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "https://www.googleapis.com/auth/gmail.send".to_string(),
            ],
            client_auth: ClientAuth::RequestBody,
            extra_auth_params: BTreeMap::from([
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ]),
            rotates_refresh_token: false,
        }
    }

    fn airtable() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: builtin_url(AIRTABLE_AUTH_URL),
            token_url: builtin_url(AIRTABLE_TOKEN_URI),
            identity_url: Some(builtin_url(AIRTABLE_WHOAMI_URI)),
            redirect_url: None,
            scopes: vec![
                "data.records:read".to_string(),
                "data.records:write".to_string(),
                "schema.bases:read".to_string(),
                "user.email:read".to_string(),
            ],
            client_auth: ClientAuth::BasicAuth,
            extra_auth_params: BTreeMap::new(),
            rotates_refresh_token: true,
        }
    }
}

fn seconds_setting(name: &str, secs: i64) -> Result<chrono::Duration, KeeperError> {
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| KeeperError::Config(format!("{name} is out of range: {secs}")))
}

// Only called with the literal constants above.
fn builtin_url(raw: &'static str) -> Url {
    Url::parse(raw).unwrap_or_else(|e| panic!("built-in URL {raw} is invalid: {e}"))
}
