//! Pooled database engine with connect-time hooks.
//!
//! Physical connections are opened lazily by the pool. Each one, whenever
//! it is opened, gets a fresh [`ConnectArgs`] built from the engine's
//! parameters, runs every registered [`ConnectHook`], and has the resulting
//! pre-connect attributes attached before it is handed to a caller.

use super::params::{ConnectArgs, ConnectionParams};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type SqlitePool = Pool<Sqlite>;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Callback run on every new physical connection, before first use.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    /// Registration key; a second hook with the same name replaces the first.
    fn name(&self) -> &'static str;

    async fn before_connect(&self, args: &mut ConnectArgs) -> StoreResult<()>;
}

#[derive(Default)]
struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ConnectHook>>>,
}

impl HookRegistry {
    fn register(&self, hook: Arc<dyn ConnectHook>) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        match hooks.iter_mut().find(|h| h.name() == hook.name()) {
            Some(existing) => {
                *existing = hook;
                true
            }
            None => {
                hooks.push(hook);
                false
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Most recent hook failure, kept until a connection opens successfully.
#[derive(Debug, Clone)]
struct HookFailure {
    hook: &'static str,
    authentication: bool,
    message: String,
}

impl HookFailure {
    fn from_error(hook: &'static str, e: &StoreError) -> Self {
        match e {
            StoreError::Authentication(message) => Self {
                hook,
                authentication: true,
                message: message.clone(),
            },
            other => Self {
                hook,
                authentication: false,
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> StoreError {
        if self.authentication {
            StoreError::Authentication(self.message.clone())
        } else {
            StoreError::ConnectHook {
                hook: self.hook,
                message: self.message.clone(),
            }
        }
    }
}

/// Handle to the connection pool. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Engine {
    pool: SqlitePool,
    params: Arc<ConnectionParams>,
    hooks: Arc<HookRegistry>,
    connects: Arc<AtomicU64>,
    hook_failure: Arc<Mutex<Option<HookFailure>>>,
}

impl Engine {
    /// Build the engine from a `key=value;` connection string.
    ///
    /// Nothing is connected yet; the first operation opens the first
    /// connection. Fails with `EngineCreation` outside a tokio runtime.
    pub fn create(connection_string: &str, echo: bool) -> StoreResult<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StoreError::EngineCreation(
                "no tokio runtime to drive the connection pool".into(),
            ));
        }
        let params = ConnectionParams::parse(connection_string)?;
        let (options, in_memory) = sqlite_options(&params, echo)?;

        let max_connections = match params.get_any(&["Max Pool Size", "Max_Pool_Size"]) {
            Some(v) => parse_number::<u32>("Max Pool Size", v)?.max(1),
            None => DEFAULT_MAX_CONNECTIONS,
        };
        let acquire_timeout = match params.get_any(&["Connect Timeout", "Connection Timeout"]) {
            Some(v) => parse_number::<u64>("Connect Timeout", v)?,
            None => DEFAULT_ACQUIRE_TIMEOUT_SECS,
        };

        let params = Arc::new(params);
        let hooks = Arc::new(HookRegistry::default());
        let connects = Arc::new(AtomicU64::new(0));
        let hook_failure = Arc::new(Mutex::new(None));

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(acquire_timeout));
        if in_memory {
            // An in-memory database lives and dies with its single connection.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let hook_params = params.clone();
        let hook_registry = hooks.clone();
        let hook_connects = connects.clone();
        let hook_failures = hook_failure.clone();
        let pool = pool_options
            .after_connect(move |conn, _meta| {
                let params = hook_params.clone();
                let hooks = hook_registry.clone();
                let connects = hook_connects.clone();
                let failures = hook_failures.clone();
                Box::pin(async move {
                    let mut args = ConnectArgs::for_connect(&params);
                    for hook in hooks.snapshot() {
                        if let Err(e) = hook.before_connect(&mut args).await {
                            warn!(hook = hook.name(), error = %e, "connect hook failed");
                            *failures.lock().unwrap_or_else(|p| p.into_inner()) =
                                Some(HookFailure::from_error(hook.name(), &e));
                            return Err(sqlx::Error::Configuration(Box::new(e)));
                        }
                    }
                    attach_attributes(conn, &args).await?;
                    failures.lock().unwrap_or_else(|p| p.into_inner()).take();
                    let n = connects.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(
                        connection = n,
                        attributes = args.attrs_before.len(),
                        "physical connection opened"
                    );
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        info!(
            database = params.get_any(&["Database", "Data Source"]).unwrap_or("-"),
            max_connections,
            echo,
            "engine created"
        );
        Ok(Self {
            pool,
            params,
            hooks,
            connects,
            hook_failure,
        })
    }

    /// Register a standing connect-time hook for the lifetime of the engine.
    pub fn listen(&self, hook: Arc<dyn ConnectHook>) {
        let name = hook.name();
        if self.hooks.register(hook) {
            debug!(hook = name, "connect hook re-registered; replaced previous instance");
        } else {
            debug!(hook = name, "connect hook registered");
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Physical connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Explain a pool timeout by the hook failure that kept connections
    /// from opening, if there was one.
    pub(crate) fn blocked_by_hook(&self, e: &sqlx::Error) -> Option<StoreError> {
        if !matches!(e, sqlx::Error::PoolTimedOut) {
            return None;
        }
        self.hook_failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(HookFailure::to_error)
    }

    pub(crate) fn ensure_live(&self) -> StoreResult<()> {
        if self.is_disposed() {
            return Err(StoreError::EngineDisposed);
        }
        Ok(())
    }

    /// Close every pooled connection. Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.pool.is_closed() {
            debug!("engine already disposed");
            return;
        }
        self.pool.close().await;
        info!(
            connections_opened = self.connections_opened(),
            "engine disposed"
        );
    }
}

/// SQLite has no pre-login attribute slots, so the attributes are kept in a
/// connection-scoped temp table for the lifetime of that connection.
async fn attach_attributes(
    conn: &mut SqliteConnection,
    args: &ConnectArgs,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TEMP TABLE IF NOT EXISTS connect_attributes (
            slot INTEGER PRIMARY KEY,
            value BLOB NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM temp.connect_attributes")
        .execute(&mut *conn)
        .await?;
    for (slot, value) in &args.attrs_before {
        sqlx::query("INSERT INTO temp.connect_attributes (slot, value) VALUES (?, ?)")
            .bind(i64::from(*slot))
            .bind(value.clone())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Read back an attribute attached to a live connection.
pub async fn connection_attribute(
    conn: &mut SqliteConnection,
    slot: u32,
) -> StoreResult<Option<Vec<u8>>> {
    let row: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT value FROM temp.connect_attributes WHERE slot = ?")
            .bind(i64::from(slot))
            .fetch_optional(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
    Ok(row.map(|r| r.0))
}

fn sqlite_options(
    params: &ConnectionParams,
    echo: bool,
) -> StoreResult<(SqliteConnectOptions, bool)> {
    let database = params
        .get_any(&["Database", "Data Source", "Initial Catalog"])
        .ok_or_else(|| StoreError::EngineCreation("missing `Database` parameter".into()))?;
    if database.trim().is_empty() {
        return Err(StoreError::EngineCreation(
            "`Database` parameter is empty".into(),
        ));
    }
    let busy_timeout = match params.get("Busy Timeout") {
        Some(v) => parse_number::<u64>("Busy Timeout", v)?,
        None => DEFAULT_BUSY_TIMEOUT_SECS,
    };

    let in_memory = database == ":memory:";
    let mut options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::EngineCreation(e.to_string()))?
    } else {
        SqliteConnectOptions::new()
            .filename(database)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    };
    options = options
        .busy_timeout(Duration::from_secs(busy_timeout))
        .foreign_keys(true);
    if !echo {
        options = options.disable_statement_logging();
    }
    Ok((options, in_memory))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> StoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::EngineCreation(format!("`{key}` is not a number: {value}")))
}
