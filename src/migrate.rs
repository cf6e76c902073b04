//! Schema creation. Every statement is `IF NOT EXISTS`, so running it on each
//! open is safe.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `arc init`: create the database file and schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Messages keyed by the platform-assigned id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            author_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            indexed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local vector index backend
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_vectors (
            message_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            text TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            guild_id TEXT,
            subject TEXT NOT NULL,
            variant TEXT NOT NULL,
            stage TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_indexed ON messages(indexed)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
