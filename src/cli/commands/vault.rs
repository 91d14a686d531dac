//! `praktor vault` subcommands.
//!
//! These operate on the store directly so they work whether or not the
//! gateway is running; secret lifecycle events are published best-effort
//! when a broker is reachable.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::json;

use crate::cli::types::VaultCommands;
use crate::domain::models::config::Config;
use crate::domain::models::secret::{Secret, SecretKind};
use crate::infrastructure::bus::topics::{self, EventPayload};
use crate::infrastructure::store::{SecretRepo, StoreConnection};
use crate::infrastructure::vault::Vault;

pub async fn handle(config: &Config, command: VaultCommands) -> Result<()> {
    let passphrase = config
        .vault
        .passphrase
        .as_deref()
        .context("vault.passphrase is required (or set PRAKTOR_VAULT_PASSPHRASE)")?;
    let vault = Vault::new(passphrase)?;

    let store = StoreConnection::open(Path::new(&config.data_dir).join("praktor.db")).await?;
    store.migrate().await?;
    let repo = Arc::new(SecretRepo::new(store.pool().clone()));

    match command {
        VaultCommands::List => list(&repo).await?,
        VaultCommands::Set {
            name,
            value,
            description,
            from_file,
            filename,
        } => {
            set(&repo, &vault, name, value, description, from_file, filename, config).await?;
        }
        VaultCommands::Get { name } => get(&repo, &vault, &name).await?,
        VaultCommands::Delete { name } => {
            if repo.delete(&name).await? {
                publish_event(config, "deleted", &name).await;
                println!("deleted '{name}'");
            } else {
                bail!("no secret named '{name}'");
            }
        }
        VaultCommands::Assign { name, agent_id } => {
            ensure_exists(&repo, &name).await?;
            repo.assign(&name, &agent_id).await?;
            println!("assigned '{name}' to '{agent_id}'");
        }
        VaultCommands::Unassign { name, agent_id } => {
            if repo.unassign(&name, &agent_id).await? {
                println!("unassigned '{name}' from '{agent_id}'");
            } else {
                bail!("'{name}' was not assigned to '{agent_id}'");
            }
        }
        VaultCommands::Global { name, off } => {
            ensure_exists(&repo, &name).await?;
            repo.set_global(&name, !off).await?;
            println!(
                "'{name}' is now {}",
                if off { "agent-scoped" } else { "global" }
            );
        }
    }

    store.close().await;
    Ok(())
}

async fn ensure_exists(repo: &SecretRepo, name: &str) -> Result<()> {
    if repo.get(name).await?.is_none() {
        bail!("no secret named '{name}'");
    }
    Ok(())
}

async fn list(repo: &SecretRepo) -> Result<()> {
    let secrets = repo.list().await?;
    if secrets.is_empty() {
        println!("no secrets stored");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["name", "kind", "global", "assigned to", "description"]);
    for secret in secrets {
        let assigned = repo.assignments(&secret.name).await?.join(", ");
        table.add_row(vec![
            secret.name.clone(),
            secret.kind.as_str().to_string(),
            if secret.global { "yes" } else { "no" }.to_string(),
            assigned,
            secret.description.clone(),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn set(
    repo: &SecretRepo,
    vault: &Vault,
    name: String,
    value: Option<String>,
    description: String,
    from_file: Option<std::path::PathBuf>,
    filename: Option<String>,
    config: &Config,
) -> Result<()> {
    let (kind, plaintext) = match &from_file {
        Some(path) => {
            let content =
                std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            (SecretKind::File, content)
        }
        None => {
            let value = match value {
                Some(value) => value,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("failed to read secret from stdin")?;
                    buffer.trim_end_matches('\n').to_string()
                }
            };
            (SecretKind::String, value.into_bytes())
        }
    };

    let (ciphertext, nonce) = vault.encrypt(&plaintext)?;
    let filename = filename.or_else(|| {
        from_file
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    });

    let now = Utc::now();
    let existing = repo.get(&name).await?;
    let secret = Secret {
        name: name.clone(),
        description,
        kind,
        filename,
        ciphertext,
        nonce,
        global: existing.as_ref().is_some_and(|s| s.global),
        created_at: existing.as_ref().map_or(now, |s| s.created_at),
        updated_at: now,
    };
    repo.upsert(&secret).await?;
    publish_event(config, if existing.is_some() { "updated" } else { "created" }, &name).await;
    println!("stored '{name}'");
    Ok(())
}

async fn get(repo: &SecretRepo, vault: &Vault, name: &str) -> Result<()> {
    let Some(secret) = repo.get(name).await? else {
        bail!("no secret named '{name}'");
    };
    match secret.kind {
        SecretKind::String => {
            println!("{}", vault.decrypt_string(&secret.ciphertext, &secret.nonce)?);
        }
        SecretKind::File => {
            use std::io::Write;
            let bytes = vault.decrypt(&secret.ciphertext, &secret.nonce)?;
            std::io::stdout().write_all(&bytes)?;
        }
    }
    Ok(())
}

/// Publish `events.secret.{action}` when the gateway's broker is up;
/// silently skipped otherwise.
async fn publish_event(config: &Config, action: &str, name: &str) {
    let url = format!("nats://127.0.0.1:{}", config.nats.port);
    let Ok(client) = async_nats::connect(&url).await else {
        return;
    };
    let event = EventPayload::new(action, json!({"name": name}));
    if let Ok(bytes) = serde_json::to_vec(&event) {
        let _ = client
            .publish(topics::events_secret(action), bytes.into())
            .await;
        let _ = client.flush().await;
    }
}
