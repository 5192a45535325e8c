pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod service;

pub use auth::{AccessToken, CredentialProvider, DefaultCredential, TokenCredential};
pub use config::Config;
pub use db::{Engine, MemoryStore, Predicate};
pub use error::{StoreError, StoreResult};
