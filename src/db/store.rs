use super::engine::Engine;
use super::filter::Predicate;
use super::models::{EmbeddingData, PromptMemoryEntry, ScoreEntry};
use super::schema::{self, Entry, Schema, SchemaPolicy};
use super::session::Session;
use crate::auth::{AccessTokenHook, CredentialProvider, TokenCredential};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub schema_policy: SchemaPolicy,
    /// Upper bound for each store operation, including waiting for a pooled connection.
    pub operation_timeout: Option<Duration>,
}

impl From<&Config> for StoreOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            schema_policy: cfg.schema_policy,
            operation_timeout: cfg.operation_timeout(),
        }
    }
}

/// Transactional access to the declared tables.
///
/// Every operation runs in its own [`Session`]; nothing is shared between
/// operations except the engine's pool. Construct one store and hand out
/// references (or an `Arc`) to every consumer.
pub struct MemoryStore {
    engine: Engine,
    schema: Schema,
    options: StoreOptions,
    provider: Option<Arc<CredentialProvider>>,
}

impl MemoryStore {
    /// Tables for prompt pieces, scores and embeddings.
    pub fn default_schema() -> Schema {
        Schema::new()
            .with::<PromptMemoryEntry>()
            .with::<ScoreEntry>()
            .with::<EmbeddingData>()
    }

    /// Acquire a token, build the engine with the token hook, and ensure the schema.
    pub async fn connect(
        config: &Config,
        credential: Arc<dyn TokenCredential>,
    ) -> StoreResult<Self> {
        let provider = Arc::new(CredentialProvider::new(
            credential,
            config.refresh_margin(),
        ));
        // Fail before touching the database if no credential source works.
        provider.get_token().await?;

        let engine = Engine::create(&config.db_connection_string, config.echo)?;
        engine.listen(Arc::new(AccessTokenHook::new(provider.clone())));

        let store = Self::with_engine(engine, Self::default_schema(), config.into())
            .with_provider(provider);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing engine; hooks and schema setup are up to the caller.
    pub fn with_engine(engine: Engine, schema: Schema, options: StoreOptions) -> Self {
        Self {
            engine,
            schema,
            options,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<CredentialProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn credential_provider(&self) -> Option<&Arc<CredentialProvider>> {
        self.provider.as_ref()
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        self.engine.ensure_live()?;
        self.with_deadline(async {
            self.authorize().await?;
            schema::ensure_schema(&self.engine, &self.schema, self.options.schema_policy).await
        })
        .await
    }

    /// Drop and recreate every declared table. Destroys all stored rows.
    pub async fn reset_database(&self) -> StoreResult<()> {
        self.engine.ensure_live()?;
        self.with_deadline(async {
            self.authorize().await?;
            schema::reset(&self.engine, &self.schema).await
        })
        .await
    }

    pub async fn insert_one<E: Entry>(&self, entry: &E) -> StoreResult<()> {
        self.insert_many(std::slice::from_ref(entry)).await
    }

    /// Insert all entries in one transaction; either all rows land or none do.
    pub async fn insert_many<E: Entry>(&self, entries: &[E]) -> StoreResult<()> {
        self.engine.ensure_live()?;
        if entries.is_empty() {
            return Ok(());
        }
        let rows = entries
            .iter()
            .map(E::values)
            .collect::<StoreResult<Vec<_>>>()
            .inspect_err(|e| warn!(table = E::TABLE, error = %e, "entry rejected before insert"))?;

        self.with_deadline(async {
            let mut session = self.begin(E::TABLE, StoreError::write).await?;

            if let Err(e) = session.add_all::<E>(&rows).await {
                if let Err(rb) = session.rollback().await {
                    warn!(table = E::TABLE, error = %rb, "rollback failed");
                }
                error!(
                    table = E::TABLE,
                    count = entries.len(),
                    error = %e,
                    "insert failed; transaction rolled back"
                );
                return Err(StoreError::write(E::TABLE, e));
            }

            session.commit().await.map_err(|e| {
                error!(table = E::TABLE, error = %e, "commit failed");
                StoreError::write(E::TABLE, e)
            })?;
            debug!(table = E::TABLE, count = entries.len(), "entries inserted");
            Ok(())
        })
        .await
    }

    /// Rows of `E` matching `predicate` (all rows when `None`).
    pub async fn query<E: Entry>(&self, predicate: Option<&Predicate>) -> StoreResult<Vec<E>> {
        self.engine.ensure_live()?;
        if let Some(p) = predicate {
            p.validate(E::COLUMNS)?;
        }
        self.with_deadline(async {
            let mut session = self.begin(E::TABLE, StoreError::read).await?;
            let rows = session.select::<E>(predicate).await;
            session.close().await;
            rows.map_err(|e| {
                error!(table = E::TABLE, error = %e, "query failed");
                StoreError::read(E::TABLE, e)
            })
        })
        .await
    }

    /// Like [`query`](Self::query), but a failed read yields no rows.
    ///
    /// Disposal and malformed predicates are still reported as errors.
    pub async fn query_or_empty<E: Entry>(
        &self,
        predicate: Option<&Predicate>,
    ) -> StoreResult<Vec<E>> {
        match self.query(predicate).await {
            Err(e @ (StoreError::StorageRead { .. } | StoreError::Timeout(_))) => {
                warn!(table = E::TABLE, error = %e, "read failed; returning no rows");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub async fn count<E: Entry>(&self) -> StoreResult<i64> {
        self.engine.ensure_live()?;
        self.with_deadline(async {
            let mut session = self.begin(E::TABLE, StoreError::read).await?;
            let n = session.count::<E>().await;
            session.close().await;
            n.map_err(|e| StoreError::read(E::TABLE, e))
        })
        .await
    }

    /// Release every pooled connection. Later operations fail with
    /// [`StoreError::EngineDisposed`].
    pub async fn dispose(&self) {
        self.engine.dispose().await;
        info!("memory store disposed");
    }

    /// Fetch or reuse the token before asking the pool for a connection.
    async fn authorize(&self) -> StoreResult<()> {
        if let Some(provider) = &self.provider {
            provider.get_token().await?;
        }
        Ok(())
    }

    async fn begin(
        &self,
        table: &'static str,
        classify: fn(&'static str, sqlx::Error) -> StoreError,
    ) -> StoreResult<Session> {
        self.authorize().await?;
        Session::begin(&self.engine).await.map_err(|e| {
            self.engine
                .blocked_by_hook(&e)
                .unwrap_or_else(|| classify(table, e))
        })
    }

    async fn with_deadline<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match self.options.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                warn!(?limit, "store operation timed out");
                StoreError::Timeout(limit)
            })?,
            None => fut.await,
        }
    }
}
