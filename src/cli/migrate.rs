//! `migrate` command

use anyhow::{Context, Result};
use execstream_postgres::{connect_pool, run_migrations};

use crate::settings::AppConfig;

/// Apply the schema and trigger
pub async fn run(config: &AppConfig) -> Result<()> {
    let pool = connect_pool(&config.database)
        .await
        .context("Failed to connect to database")?;

    run_migrations(&pool, &config.events.channel)
        .await
        .context("Failed to run migrations")?;
    pool.close().await;

    println!(
        "Migrations applied (notification channel: {})",
        config.events.channel
    );
    Ok(())
}
