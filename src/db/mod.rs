//! Database module: connection factory, schema, records and the transactional store.
//!
//! Layout:
//! - `params.rs`: connection-string parsing and per-connect arguments
//! - `engine.rs`: pooled engine with connect-time hooks and disposal
//! - `schema.rs`: `Entry` trait, declared tables, create/reset
//! - `models.rs`: Rust structs mirroring DB rows
//! - `filter.rs`: bound values and predicates
//! - `session.rs`: one transaction per operation
//! - `store.rs`: insert/query operations with commit-or-rollback

pub mod engine;
pub mod filter;
pub mod models;
pub mod params;
pub mod schema;
pub mod session;
pub mod store;

pub use engine::{ConnectHook, Engine, SqlitePool, connection_attribute};
pub use filter::{Predicate, SqlValue};
pub use models::{EmbeddingData, PromptMemoryEntry, ScoreEntry};
pub use params::{ConnectArgs, ConnectionParams};
pub use schema::{Entry, Schema, SchemaPolicy, TableDef};
pub use session::Session;
pub use store::{MemoryStore, StoreOptions};
