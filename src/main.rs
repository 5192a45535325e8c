use azsql_memory::db::schema;
use azsql_memory::{Config, DefaultCredential, MemoryStore};
use mimalloc::MiMalloc;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::from_env()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    if cfg.db_connection_string.trim().is_empty() {
        error!("AZURE_SQL_DB_CONNECTION_STRING is not set");
        return Err("missing AZURE_SQL_DB_CONNECTION_STRING".into());
    }

    info!(
        echo = cfg.echo,
        schema_policy = ?cfg.schema_policy,
        refresh_margin_secs = cfg.token_refresh_margin_secs,
        reset_on_start = cfg.reset_on_start,
        tenant = %cfg.identity.tenant_id.as_deref().unwrap_or("<none>"),
    );

    let credential = Arc::new(DefaultCredential::from_config(&cfg)?);
    let store = MemoryStore::connect(&cfg, credential).await?;

    if cfg.reset_on_start {
        warn!("AZURE_SQL_RESET_ON_START set; dropping and recreating tables");
        store.reset_database().await?;
    }

    match schema::table_names(store.engine()).await {
        Ok(tables) => info!(count = tables.len(), tables = ?tables, "database ready"),
        Err(e) => warn!(error = %e, "failed to list tables"),
    }

    store.dispose().await;
    Ok(())
}
