//! Token-based authentication for database connections.
//!
//! - `token.rs`: the bearer token value
//! - `encoder.rs`: driver attribute layout for the token
//! - `provider.rs`: credential trait plus the caching, refreshing provider
//! - `identity.rs`: service principal, managed identity and CLI sources
//! - `hook.rs`: connect-time hook that attaches the token

pub mod encoder;
pub mod hook;
pub mod identity;
pub mod provider;
pub mod token;

pub use encoder::{SQL_COPT_SS_ACCESS_TOKEN, encode, encode_token};
pub use hook::AccessTokenHook;
pub use identity::{
    AzureCliCredential, ChainedCredential, ClientSecretCredential, DefaultCredential,
    ManagedIdentityCredential,
};
pub use provider::{CredentialProvider, StaticCredential, TokenCredential};
pub use token::AccessToken;
