//! Message store: the durable table behind deduplication and incremental
//! indexing.
//!
//! Rows are keyed by the platform message id. Upserts replace the row and
//! reset `indexed` to false, so a re-exported message is always re-embedded.
//! Only [`MessageStore::mark_indexed`] sets the flag.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::StageResult;
use crate::models::Message;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub indexed: i64,
    pub pending: i64,
}

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a message, always leaving it unindexed.
    pub async fn upsert(&self, message: &Message) -> StageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, content, author_id, channel_id, sent_at, indexed)
            VALUES (?, ?, ?, ?, ?, 0)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                author_id = excluded.author_id,
                channel_id = excluded.channel_id,
                sent_at = excluded.sent_at,
                indexed = 0
            "#,
        )
        .bind(&message.id)
        .bind(&message.content)
        .bind(&message.author_id)
        .bind(&message.channel_id)
        .bind(&message.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> StageResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, content, author_id, channel_id, sent_at, indexed FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    /// Every message still waiting for the vector index, oldest first.
    pub async fn unindexed(&self) -> StageResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content, author_id, channel_id, sent_at, indexed
            FROM messages
            WHERE indexed = 0
            ORDER BY sent_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Flip `indexed` for every id in one transaction.
    pub async fn mark_indexed(&self, ids: &[String]) -> StageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for id in ids {
            let res = sqlx::query("UPDATE messages SET indexed = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            updated += res.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn stats(&self) -> StageResult<StoreStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(indexed), 0) AS indexed FROM messages",
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        let indexed: i64 = row.get("indexed");
        Ok(StoreStats {
            total,
            indexed,
            pending: total - indexed,
        })
    }
}

fn row_to_message(row: &SqliteRow) -> Message {
    let indexed: i64 = row.get("indexed");
    Message {
        id: row.get("id"),
        content: row.get("content"),
        author_id: row.get("author_id"),
        channel_id: row.get("channel_id"),
        sent_at: row.get("sent_at"),
        indexed: indexed != 0,
    }
}
