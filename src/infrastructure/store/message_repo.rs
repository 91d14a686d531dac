//! Chat log persistence.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime};
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::message::{MessageDirection, StoredMessage};

pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &SqliteRow) -> GatewayResult<StoredMessage> {
        let direction = match row.get::<String, _>("direction").as_str() {
            "inbound" => MessageDirection::Inbound,
            "outbound" => MessageDirection::Outbound,
            other => return Err(GatewayError::Store(format!("bad direction '{other}'"))),
        };
        Ok(StoredMessage {
            id: Uuid::parse_str(row.get::<String, _>("id").as_str())
                .map_err(|e| GatewayError::Store(e.to_string()))?,
            agent_id: row.get("agent_id"),
            direction,
            content: row.get("content"),
            meta: serde_json::from_str(row.get::<String, _>("meta_json").as_str())?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
        })
    }

    pub async fn append(&self, message: &StoredMessage) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, agent_id, direction, content, meta_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(&message.agent_id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(serde_json::to_string(&message.meta)?)
        .bind(fmt_datetime(message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent messages for an agent, oldest first.
    pub async fn recent(&self, agent_id: &str, limit: i64) -> GatewayResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT * FROM messages WHERE agent_id = ?
                 ORDER BY created_at DESC LIMIT ?
             ) ORDER BY created_at ASC",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }
}
