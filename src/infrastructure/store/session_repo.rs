//! Session persistence: agent id → conversation token.

use sqlx::{Row, SqlitePool};

use super::{fmt_datetime, parse_datetime};
use crate::domain::errors::GatewayResult;
use crate::domain::models::session::Session;

pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, agent_id: &str) -> GatewayResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Session {
                agent_id: r.get("agent_id"),
                session_id: r.get("session_id"),
                last_seen: parse_datetime(r.get::<String, _>("last_seen").as_str())?,
            })
        })
        .transpose()
    }

    pub async fn put(&self, session: &Session) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO sessions (agent_id, session_id, last_seen) VALUES (?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET
               session_id = excluded.session_id,
               last_seen = excluded.last_seen",
        )
        .bind(&session.agent_id)
        .bind(&session.session_id)
        .bind(fmt_datetime(session.last_seen))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear(&self, agent_id: &str) -> GatewayResult<()> {
        sqlx::query("DELETE FROM sessions WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
