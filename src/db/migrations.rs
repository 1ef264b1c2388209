use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StoreError;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32, StoreError> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM _schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<(), StoreError> {
    debug!("Running migration v1: creating initial schema");

    let statements = [
        r"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            subheadline TEXT,
            author TEXT,
            section TEXT,
            content TEXT NOT NULL,
            date TEXT,
            image_urls TEXT NOT NULL DEFAULT '[]',
            source_url TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
        "CREATE INDEX IF NOT EXISTS idx_articles_date ON articles(date)",
        "CREATE INDEX IF NOT EXISTS idx_articles_created_at ON articles(created_at)",
        r"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            phase TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            total INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            duplicates INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS backup_gaps (
            key TEXT PRIMARY KEY,
            error TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        )
        ",
    ];

    let mut tx = pool.begin().await?;
    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<(), StoreError> {
    debug!("Running migration v2: run lease heartbeat");

    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE runs ADD COLUMN heartbeat_at TEXT")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE runs SET heartbeat_at = started_at WHERE heartbeat_at IS NULL")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
