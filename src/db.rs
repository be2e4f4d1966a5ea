use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;

pub async fn init_db(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir: {}", parent.display()))?;
    }

    // foreign_keys is per-connection; setting it here covers every pooled
    // connection (task-owned rows cascade on delete).
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to connect to database at {}", db_path.display()))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    log::info!("Database initialized at {}", db_path.display());
    Ok(pool)
}

#[cfg(test)]
pub async fn test_pool(dir: &Path) -> SqlitePool {
    init_db(&dir.join("test.db")).await.expect("test db init")
}
