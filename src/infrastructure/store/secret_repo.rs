//! Sealed secret persistence and agent assignment.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{fmt_datetime, parse_datetime};
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::secret::{Secret, SecretKind};

pub struct SecretRepo {
    pool: SqlitePool,
}

impl SecretRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_secret(row: &SqliteRow) -> GatewayResult<Secret> {
        let kind_str: String = row.get("kind");
        let kind = SecretKind::from_str(&kind_str)
            .ok_or_else(|| GatewayError::Store(format!("bad secret kind '{kind_str}'")))?;
        Ok(Secret {
            name: row.get("name"),
            description: row.get("description"),
            kind,
            filename: row.get("filename"),
            ciphertext: row.get("ciphertext"),
            nonce: row.get("nonce"),
            global: row.get::<i64, _>("global") != 0,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }

    /// Insert or replace a sealed secret by name.
    pub async fn upsert(&self, secret: &Secret) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO secrets (name, description, kind, filename, ciphertext, nonce,
                                  global, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
               description = excluded.description,
               kind = excluded.kind,
               filename = excluded.filename,
               ciphertext = excluded.ciphertext,
               nonce = excluded.nonce,
               global = excluded.global,
               updated_at = excluded.updated_at",
        )
        .bind(&secret.name)
        .bind(&secret.description)
        .bind(secret.kind.as_str())
        .bind(&secret.filename)
        .bind(&secret.ciphertext)
        .bind(&secret.nonce)
        .bind(i64::from(secret.global))
        .bind(fmt_datetime(secret.created_at))
        .bind(fmt_datetime(secret.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> GatewayResult<Option<Secret>> {
        let row = sqlx::query("SELECT * FROM secrets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_secret).transpose()
    }

    pub async fn list(&self) -> GatewayResult<Vec<Secret>> {
        let rows = sqlx::query("SELECT * FROM secrets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_secret).collect()
    }

    pub async fn delete(&self, name: &str) -> GatewayResult<bool> {
        sqlx::query("DELETE FROM secret_assignments WHERE secret_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM secrets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn assign(&self, name: &str, agent_id: &str) -> GatewayResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO secret_assignments (secret_name, agent_id) VALUES (?, ?)",
        )
        .bind(name)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unassign(&self, name: &str, agent_id: &str) -> GatewayResult<bool> {
        let result =
            sqlx::query("DELETE FROM secret_assignments WHERE secret_name = ? AND agent_id = ?")
                .bind(name)
                .bind(agent_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_global(&self, name: &str, global: bool) -> GatewayResult<()> {
        sqlx::query("UPDATE secrets SET global = ?, updated_at = ? WHERE name = ?")
            .bind(i64::from(global))
            .bind(fmt_datetime(Utc::now()))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Secrets visible to an agent: globals plus explicit assignments.
    pub async fn list_for_agent(&self, agent_id: &str) -> GatewayResult<Vec<Secret>> {
        let rows = sqlx::query(
            "SELECT s.* FROM secrets s
             LEFT JOIN secret_assignments a
               ON a.secret_name = s.name AND a.agent_id = ?
             WHERE s.global = 1 OR a.agent_id IS NOT NULL
             ORDER BY s.name",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_secret).collect()
    }

    /// Agent ids a secret is explicitly assigned to.
    pub async fn assignments(&self, name: &str) -> GatewayResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT agent_id FROM secret_assignments WHERE secret_name = ? ORDER BY agent_id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("agent_id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::infrastructure::store::StoreConnection;

    fn secret(name: &str, global: bool) -> Secret {
        let now = Utc::now();
        Secret {
            name: name.into(),
            description: String::new(),
            kind: SecretKind::String,
            filename: None,
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            global,
            created_at: now,
            updated_at: now,
        }
    }

    async fn repo() -> SecretRepo {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        SecretRepo::new(db.pool().clone())
    }

    #[tokio::test]
    async fn visibility_combines_global_and_assigned() {
        let repo = repo().await;
        repo.upsert(&secret("shared", true)).await.unwrap();
        repo.upsert(&secret("mine", false)).await.unwrap();
        repo.upsert(&secret("other", false)).await.unwrap();
        repo.assign("mine", "coder").await.unwrap();
        repo.assign("other", "general").await.unwrap();

        let names: Vec<String> = repo
            .list_for_agent("coder")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["mine", "shared"]);
    }

    #[tokio::test]
    async fn delete_removes_assignments() {
        let repo = repo().await;
        repo.upsert(&secret("tok", false)).await.unwrap();
        repo.assign("tok", "coder").await.unwrap();
        assert!(repo.delete("tok").await.unwrap());
        assert!(repo.assignments("tok").await.unwrap().is_empty());
        assert!(repo.get("tok").await.unwrap().is_none());
    }
}
