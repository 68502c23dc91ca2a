use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Run migrations: records, user mappings and the bus live in one database.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    tracing::info!("migrations complete");
    Ok(())
}
