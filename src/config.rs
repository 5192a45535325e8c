use crate::db::schema::SchemaPolicy;
use crate::error::StoreResult;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource every Azure SQL database issues tokens for.
pub const TOKEN_RESOURCE: &str = "https://database.windows.net/";

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Runtime configuration, merged from defaults and environment variables.
///
/// Store settings come from `AZURE_SQL_*`, identity settings from the
/// conventional `AZURE_*` variables plus `IDENTITY_ENDPOINT`/`IDENTITY_HEADER`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub db_connection_string: String,
    pub echo: bool,
    pub schema_policy: SchemaPolicy,
    pub token_refresh_margin_secs: u64,
    pub operation_timeout_secs: Option<u64>,
    pub reset_on_start: bool,
    pub loglevel: String,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IdentityConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub authority_host: Option<String>,
    pub identity_endpoint: Option<String>,
    pub identity_header: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_connection_string: String::new(),
            echo: false,
            schema_policy: SchemaPolicy::BestEffort,
            token_refresh_margin_secs: 300,
            operation_timeout_secs: None,
            reset_on_start: false,
            loglevel: "info".to_string(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> StoreResult<Self> {
        Self::figment().extract().map_err(Into::into)
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("AZURE_SQL_"))
            .merge(
                Env::prefixed("AZURE_")
                    .only(&["tenant_id", "client_id", "client_secret", "authority_host"])
                    .map(|k| format!("identity.{}", k.as_str()).into()),
            )
            .merge(
                Env::raw()
                    .only(&["identity_endpoint", "identity_header"])
                    .map(|k| format!("identity.{}", k.as_str()).into()),
            )
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn authority_host(&self) -> &str {
        self.identity
            .authority_host
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_HOST)
    }
}
