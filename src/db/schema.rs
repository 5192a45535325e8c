//! Declared tables and the create/drop operations over them.
//! SQLite-first DDL; every statement is `IF NOT EXISTS`/`IF EXISTS` guarded.

use super::engine::Engine;
use super::filter::SqlValue;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, error, info, warn};

/// A record type the store can persist and read back.
///
/// `values()` must line up with `COLUMNS`, and `FromRow` must read the
/// same column names. A row `values()` accepts must decode again.
pub trait Entry: for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// `CREATE TABLE IF NOT EXISTS` plus any index statements, `;`-separated.
    const DDL: &'static str;

    fn values(&self) -> StoreResult<Vec<SqlValue>>;

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE, Self::DDL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub ddl: &'static str,
}

impl TableDef {
    pub const fn new(name: &'static str, ddl: &'static str) -> Self {
        Self { name, ddl }
    }
}

/// Tables in declaration order. Parents must be declared before children.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: Vec<TableDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<E: Entry>(self) -> Self {
        self.with_table(E::table_def())
    }

    pub fn with_table(mut self, def: TableDef) -> Self {
        if !self.contains(def.name) {
            self.tables.push(def);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name == name)
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }
}

/// What to do when creating a table fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// Stop and return the error.
    Strict,
    /// Log the error and carry on with the remaining tables.
    #[default]
    BestEffort,
}

/// Create every declared table that does not exist yet.
pub async fn ensure_schema(
    engine: &Engine,
    schema: &Schema,
    policy: SchemaPolicy,
) -> StoreResult<()> {
    engine.ensure_live()?;
    let mut failed = 0usize;
    for table in schema.tables() {
        match run_ddl(engine, table.ddl).await {
            Ok(()) => debug!(table = table.name, "table ensured"),
            Err(sqlx::Error::PoolClosed) => return Err(StoreError::EngineDisposed),
            Err(source) => match policy {
                SchemaPolicy::Strict => {
                    error!(table = table.name, error = %source, "table creation failed");
                    return Err(StoreError::Schema {
                        table: table.name,
                        source,
                    });
                }
                SchemaPolicy::BestEffort => {
                    failed += 1;
                    warn!(
                        table = table.name,
                        error = %source,
                        "table creation failed; continuing"
                    );
                }
            },
        }
    }
    info!(
        tables = schema.tables().len(),
        failed,
        ?policy,
        "schema initialization finished"
    );
    Ok(())
}

/// Drop every declared table, then create them again.
///
/// Not atomic: an interruption between the two phases leaves the database
/// without the tables. Never call this on a store that is in use.
pub async fn reset(engine: &Engine, schema: &Schema) -> StoreResult<()> {
    engine.ensure_live()?;
    warn!(tables = schema.tables().len(), "dropping all declared tables");
    for table in schema.tables().iter().rev() {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name))
            .execute(engine.pool())
            .await
            .map_err(|e| schema_error(table.name, e))?;
    }
    for table in schema.tables() {
        run_ddl(engine, table.ddl)
            .await
            .map_err(|e| schema_error(table.name, e))?;
    }
    info!("database reset complete");
    Ok(())
}

/// User tables currently present in the database, sorted by name.
pub async fn table_names(engine: &Engine) -> StoreResult<Vec<String>> {
    engine.ensure_live()?;
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(engine.pool())
    .await
    .map_err(StoreError::from_sqlx)?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

async fn run_ddl(engine: &Engine, ddl: &str) -> Result<(), sqlx::Error> {
    // sqlx::query runs one statement at a time.
    for stmt in ddl.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(engine.pool()).await?;
    }
    Ok(())
}

fn schema_error(table: &'static str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolClosed => StoreError::EngineDisposed,
        source => StoreError::Schema { table, source },
    }
}
