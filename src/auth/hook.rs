use super::encoder::{SQL_COPT_SS_ACCESS_TOKEN, encode};
use super::provider::CredentialProvider;
use crate::db::engine::ConnectHook;
use crate::db::params::{ConnectArgs, TRUSTED_CONNECTION};
use crate::error::StoreResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Attaches the current database token to every new physical connection.
///
/// The token is looked up when the connection is opened, not when the hook
/// is registered, so connections opened late in the process lifetime get a
/// token that is still valid.
pub struct AccessTokenHook {
    provider: Arc<CredentialProvider>,
}

impl AccessTokenHook {
    pub const NAME: &'static str = "access_token";

    pub fn new(provider: Arc<CredentialProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ConnectHook for AccessTokenHook {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn before_connect(&self, args: &mut ConnectArgs) -> StoreResult<()> {
        // Integrated security and token auth are mutually exclusive.
        if args.params.remove(TRUSTED_CONNECTION) {
            debug!("stripped Trusted_Connection from connect arguments");
        }

        let token = self.provider.get_token().await?;
        args.attrs_before
            .insert(SQL_COPT_SS_ACCESS_TOKEN, encode(&token)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::encoder::encode_token;
    use crate::auth::provider::StaticCredential;
    use crate::auth::token::AccessToken;
    use crate::db::params::ConnectionParams;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    #[tokio::test]
    async fn strips_trusted_connection_and_attaches_token() {
        let cred = Arc::new(StaticCredential::new(AccessToken::new(
            "tok-1",
            Utc::now() + ChronoDuration::hours(1),
        )));
        let provider = Arc::new(CredentialProvider::new(cred, Duration::from_secs(60)));
        let hook = AccessTokenHook::new(provider);

        let params = ConnectionParams::parse("Server=db.example.net;Database=memory").unwrap();
        let mut args = ConnectArgs::for_connect(&params);
        assert!(args.params.contains(TRUSTED_CONNECTION));

        hook.before_connect(&mut args).await.unwrap();
        assert!(!args.params.contains(TRUSTED_CONNECTION));
        assert_eq!(args.params.get("Server"), Some("db.example.net"));
        assert_eq!(args.attrs_before.len(), 1);
        assert_eq!(
            args.attrs_before.get(&SQL_COPT_SS_ACCESS_TOKEN),
            Some(&encode_token("tok-1").unwrap())
        );

        // Running twice over the same arguments still yields one attribute.
        hook.before_connect(&mut args).await.unwrap();
        assert_eq!(args.attrs_before.len(), 1);
    }
}
