//! Swarm run persistence.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime};
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::swarm::{RoleResult, SwarmRun, SwarmStatus};

pub struct SwarmRepo {
    pool: SqlitePool,
}

impl SwarmRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &SqliteRow) -> GatewayResult<SwarmRun> {
        let status_str: String = row.get("status");
        let status = SwarmStatus::from_str(&status_str)
            .ok_or_else(|| GatewayError::Store(format!("bad swarm status '{status_str}'")))?;
        Ok(SwarmRun {
            id: Uuid::parse_str(row.get::<String, _>("id").as_str())
                .map_err(|e| GatewayError::Store(e.to_string()))?,
            name: row.get("name"),
            lead_agent: row.get("lead_agent"),
            task: row.get("task"),
            agents: serde_json::from_str(row.get::<String, _>("agents_json").as_str())?,
            synapses: serde_json::from_str(row.get::<String, _>("synapses_json").as_str())?,
            status,
            results: serde_json::from_str(row.get::<String, _>("results_json").as_str())?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }

    pub async fn insert(&self, run: &SwarmRun) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO swarm_runs (id, name, lead_agent, task, agents_json, synapses_json,
                                     status, results_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.name)
        .bind(&run.lead_agent)
        .bind(&run.task)
        .bind(serde_json::to_string(&run.agents)?)
        .bind(serde_json::to_string(&run.synapses)?)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.results)?)
        .bind(fmt_datetime(run.created_at))
        .bind(fmt_datetime(run.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the terminal status and role results of a finished run.
    pub async fn finish(
        &self,
        id: Uuid,
        status: SwarmStatus,
        results: &[RoleResult],
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE swarm_runs SET status = ?, results_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(results)?)
        .bind(fmt_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> GatewayResult<Option<SwarmRun>> {
        let row = sqlx::query("SELECT * FROM swarm_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    pub async fn list(&self, limit: i64) -> GatewayResult<Vec<SwarmRun>> {
        let rows = sqlx::query("SELECT * FROM swarm_runs ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::swarm::{SwarmAgent, Synapse};
    use crate::infrastructure::store::StoreConnection;

    #[tokio::test]
    async fn insert_finish_round_trip() {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let repo = SwarmRepo::new(db.pool().clone());

        let run = SwarmRun::new(
            "review",
            "review the PR",
            vec![SwarmAgent {
                agent_id: "coder".into(),
                role: "reviewer".into(),
                workspace: None,
                prompt: String::new(),
            }],
            vec![Synapse {
                from: "reviewer".into(),
                to: "reviewer".into(),
                bidirectional: false,
            }],
            Some("reviewer".into()),
        );
        repo.insert(&run).await.unwrap();

        repo.finish(
            run.id,
            SwarmStatus::Completed,
            &[RoleResult::success("reviewer", "looks good")],
        )
        .await
        .unwrap();

        let loaded = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SwarmStatus::Completed);
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].output, "looks good");
    }
}
