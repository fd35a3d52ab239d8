use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use lms_gamification::achievements::initialize_catalog;
use lms_gamification::config::GamificationConfig;
use lms_gamification::database::{CURRENT_SCHEMA, migrate_database_declaratively};
use lms_gamification::env::{database_url, load_environment};
use lms_gamification::reconcile::reconcile_all;
use lms_gamification::telemetry::{init_tracing, shutdown_telemetry};
use rocket::tokio;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::{error, info};

async fn prepare() -> anyhow::Result<(SqlitePool, GamificationConfig)> {
    let loaded = load_environment();
    init_tracing();
    if let Err(err) = loaded {
        error!(error = %err, "Failed to read environment files");
    }

    let config = GamificationConfig::from_env().context("invalid gamification config")?;

    let url = database_url();
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid DATABASE_URL {url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .context("failed to connect to SQLite database")?;

    info!("Running declarative schema migration");
    let changed = migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA)
        .await
        .context("database migration failed")?;
    info!(changed, "Schema is up to date");

    initialize_catalog(&pool)
        .await
        .context("failed to seed achievement catalog")?;

    Ok((pool, config))
}

fn spawn_reconciliation(pool: SqlitePool, config: GamificationConfig) {
    let interval = Duration::from_secs(config.reconcile_interval_secs.max(1));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;

        loop {
            match reconcile_all(&pool, &config).await {
                Ok(summary) if summary.aggregates_rewritten > 0 || summary.rewards_credited > 0 => {
                    info!(?summary, "Reconciliation repaired derived state");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Reconciliation pass failed: {}", e);
                }
            }

            tokio::time::sleep(interval).await;
        }
    });
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let (pool, config) = prepare().await?;

    spawn_reconciliation(pool.clone(), config.clone());

    let result = lms_gamification::build_rocket(pool, config).launch().await;
    shutdown_telemetry();

    if let Err(err) = result {
        anyhow::bail!("server failed: {}", err);
    }
    Ok(())
}
