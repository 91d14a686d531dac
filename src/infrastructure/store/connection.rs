//! SQLite connection pool with WAL mode enabled.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Connection pool manager for the gateway store.
pub struct StoreConnection {
    pool: SqlitePool,
}

impl StoreConnection {
    /// Open (creating if missing) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).context("failed to create store directory")?;
        }
        let url = format!("sqlite:{}", path.as_ref().display());
        Self::new(&url).await
    }

    /// Open the store from a sqlite URL (`sqlite:data/praktor.db` or
    /// `sqlite::memory:`).
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database exists per connection; more than one
        // pooled connection would see different databases.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to create connection pool")?;

        Ok(Self { pool })
    }

    /// Create the schema idempotently.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to apply schema statement: {statement}"))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT '',
        model TEXT,
        image TEXT,
        workspace TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        name TEXT NOT NULL,
        schedule_json TEXT NOT NULL,
        prompt TEXT NOT NULL,
        status TEXT NOT NULL,
        last_status TEXT,
        last_error TEXT,
        last_run_at TEXT,
        next_run_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, next_run_at)",
    "CREATE TABLE IF NOT EXISTS secrets (
        name TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL,
        filename TEXT,
        ciphertext BLOB NOT NULL,
        nonce BLOB NOT NULL,
        global INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS secret_assignments (
        secret_name TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        PRIMARY KEY (secret_name, agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS swarm_runs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        lead_agent TEXT,
        task TEXT NOT NULL,
        agents_json TEXT NOT NULL,
        synapses_json TEXT NOT NULL,
        status TEXT NOT NULL,
        results_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        agent_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        last_seen TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        content TEXT NOT NULL,
        meta_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(agent_id, created_at)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }
}
