//! Derived agent rows, synced from configuration by the registry.

use sqlx::{Row, SqlitePool};

use super::fmt_datetime;
use crate::domain::errors::GatewayResult;
use crate::domain::models::agent::AgentDefinition;

pub struct AgentRepo {
    pool: SqlitePool,
}

impl AgentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update the derived row for a configured agent.
    pub async fn upsert(&self, def: &AgentDefinition) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO agents (id, description, model, image, workspace, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               description = excluded.description,
               model = excluded.model,
               image = excluded.image,
               workspace = excluded.workspace,
               updated_at = excluded.updated_at",
        )
        .bind(&def.id)
        .bind(&def.description)
        .bind(&def.model)
        .bind(&def.image)
        .bind(def.workspace_name())
        .bind(fmt_datetime(chrono::Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove rows for agents no longer in the configuration.
    pub async fn retain(&self, keep_ids: &[String]) -> GatewayResult<u64> {
        let ids: Vec<String> = self.list_ids().await?;
        let mut removed = 0;
        for id in ids {
            if !keep_ids.contains(&id) {
                sqlx::query("DELETE FROM agents WHERE id = ?")
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn list_ids(&self) -> GatewayResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::StoreConnection;

    async fn repo() -> AgentRepo {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        AgentRepo::new(db.pool().clone())
    }

    #[tokio::test]
    async fn upsert_and_retain() {
        let repo = repo().await;
        for id in ["general", "coder"] {
            repo.upsert(&AgentDefinition {
                id: id.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        assert_eq!(repo.list_ids().await.unwrap(), vec!["coder", "general"]);

        let removed = repo.retain(&["general".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.list_ids().await.unwrap(), vec!["general"]);
    }
}
