use super::provider::TokenCredential;
use super::token::AccessToken;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use oauth2::{
    ClientId, ClientSecret, EndpointNotSet, EndpointSet, Scope, TokenResponse, TokenUrl,
    basic::BasicClient,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

type TokenClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Build the shared HTTP client used by the network-backed credentials.
pub fn identity_http_client() -> StoreResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent("azsql-memory/0.3")
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(15))
        .build()?;
    Ok(client)
}

/// Service principal credential using the OAuth2 client-credentials grant.
pub struct ClientSecretCredential {
    client: TokenClient,
    http: reqwest::Client,
    tenant_id: String,
}

impl ClientSecretCredential {
    pub fn new(
        authority_host: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        http: reqwest::Client,
    ) -> StoreResult<Self> {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            authority_host.trim_end_matches('/'),
            tenant_id
        );
        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.to_string()))
            .set_token_uri(TokenUrl::new(token_url)?);
        Ok(Self {
            client,
            http,
            tenant_id: tenant_id.to_string(),
        })
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    fn name(&self) -> &'static str {
        "client_secret"
    }

    async fn get_token(&self, resource: &str) -> StoreResult<AccessToken> {
        let scope = format!("{}.default", with_trailing_slash(resource));
        let resp = self
            .client
            .exchange_client_credentials()
            .add_scope(Scope::new(scope))
            .request_async(&self.http)
            .await?;
        let expires_in = resp.expires_in().unwrap_or(Duration::from_secs(3600));
        info!(tenant = %self.tenant_id, "service principal token issued");
        Ok(AccessToken::new(
            resp.access_token().secret().clone(),
            expiry_from_now(expires_in),
        ))
    }
}

/// Managed identity through the App Service endpoint or the instance metadata service.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    client_id: Option<String>,
    app_service: Option<(String, String)>,
}

impl ManagedIdentityCredential {
    pub fn new(
        http: reqwest::Client,
        client_id: Option<String>,
        identity_endpoint: Option<String>,
        identity_header: Option<String>,
    ) -> Self {
        let app_service = identity_endpoint.zip(identity_header);
        Self {
            http,
            client_id,
            app_service,
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "managed_identity"
    }

    async fn get_token(&self, resource: &str) -> StoreResult<AccessToken> {
        let mut req = match &self.app_service {
            Some((endpoint, header)) => self
                .http
                .get(endpoint.as_str())
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", resource)])
                .header("X-IDENTITY-HEADER", header.as_str()),
            None => self
                .http
                .get(IMDS_ENDPOINT)
                .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)])
                .header("Metadata", "true"),
        };
        if let Some(client_id) = &self.client_id {
            req = req.query(&[("client_id", client_id.as_str())]);
        }

        let body: Value = req.send().await?.error_for_status()?.json().await?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreError::Authentication("managed identity response has no access_token".into())
            })?;
        let expires_on = body
            .get("expires_on")
            .and_then(epoch_seconds)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| {
                StoreError::Authentication("managed identity response has no expires_on".into())
            })?;
        Ok(AccessToken::new(token, expires_on))
    }
}

/// Token from a logged-in Azure CLI session.
pub struct AzureCliCredential {
    program: String,
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self {
            program: "az".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "azure_cli"
    }

    async fn get_token(&self, resource: &str) -> StoreResult<AccessToken> {
        let output = Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--output",
                "json",
                "--resource",
                resource,
            ])
            .output()
            .await
            .map_err(|e| StoreError::Authentication(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::Authentication(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        parse_cli_token(&output.stdout)
    }
}

fn parse_cli_token(stdout: &[u8]) -> StoreResult<AccessToken> {
    let body: Value = serde_json::from_slice(stdout)?;
    let token = body
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Authentication("CLI output has no accessToken".into()))?;

    let from_epoch = body
        .get("expires_on")
        .and_then(epoch_seconds)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    // Older CLI releases only report a local wall-clock time.
    let from_local = || {
        body.get("expiresOn")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    };
    let expires_on = from_epoch
        .or_else(from_local)
        .ok_or_else(|| StoreError::Authentication("CLI output has no expiry".into()))?;
    Ok(AccessToken::new(token, expires_on))
}

/// Tries each credential in order and returns the first token issued.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &'static str {
        "chained"
    }

    async fn get_token(&self, resource: &str) -> StoreResult<AccessToken> {
        let mut failures = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.get_token(resource).await {
                Ok(token) => {
                    debug!(source = source.name(), "credential source succeeded");
                    return Ok(token);
                }
                Err(e) => {
                    debug!(source = source.name(), error = %e, "credential source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        if failures.is_empty() {
            return Err(StoreError::Authentication(
                "no credential sources configured".into(),
            ));
        }
        warn!(attempts = failures.len(), "every credential source failed");
        Err(StoreError::Authentication(failures.join("; ")))
    }
}

/// Environment service principal, then managed identity, then the Azure CLI.
pub struct DefaultCredential;

impl DefaultCredential {
    pub fn from_config(cfg: &Config) -> StoreResult<ChainedCredential> {
        let http = identity_http_client()?;
        let id = &cfg.identity;
        let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::new();

        if let (Some(tenant), Some(client_id), Some(secret)) =
            (&id.tenant_id, &id.client_id, &id.client_secret)
        {
            sources.push(Arc::new(ClientSecretCredential::new(
                cfg.authority_host(),
                tenant,
                client_id,
                secret,
                http.clone(),
            )?));
        }
        sources.push(Arc::new(ManagedIdentityCredential::new(
            http,
            id.client_id.clone(),
            id.identity_endpoint.clone(),
            id.identity_header.clone(),
        )));
        sources.push(Arc::new(AzureCliCredential::new()));

        Ok(ChainedCredential::new(sources))
    }
}

fn with_trailing_slash(resource: &str) -> String {
    if resource.ends_with('/') {
        resource.to_string()
    } else {
        format!("{resource}/")
    }
}

fn expiry_from_now(expires_in: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expires_in)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or_else(Utc::now)
}

/// Identity endpoints report epoch seconds either as a number or a string.
fn epoch_seconds(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
