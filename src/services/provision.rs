//! Materializes worker environments: merges definition env with opened
//! vault secrets and builds the `AgentOpts` handed to the container
//! manager.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::registry::Registry;
use crate::domain::errors::GatewayResult;
use crate::domain::models::agent::AgentDefinition;
use crate::domain::models::secret::SecretKind;
use crate::infrastructure::docker::{AgentOpts, SecretFileContent};
use crate::infrastructure::store::SecretRepo;
use crate::infrastructure::vault::Vault;

/// Drop directory for file secrets that carry only a filename.
const SECRET_DROP_DIR: &str = "/run/secrets";

pub struct Provisioner {
    registry: Arc<Registry>,
    secret_repo: Arc<SecretRepo>,
    vault: Vault,
    /// Broker URL as seen from inside a worker container.
    worker_nats_url: String,
}

impl Provisioner {
    pub fn new(
        registry: Arc<Registry>,
        secret_repo: Arc<SecretRepo>,
        vault: Vault,
        worker_nats_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            secret_repo,
            vault,
            worker_nats_url: worker_nats_url.into(),
        }
    }

    /// Build start options for a worker derived from `def`.
    ///
    /// `worker_id` is the container identity (the agent id, or a
    /// transient swarm worker id); `extra_env` overlays the resolved
    /// environment; `workspace` overrides the definition's workspace.
    ///
    /// Vault failures are logged and the offending entry is omitted;
    /// the remaining environment still materializes.
    pub async fn agent_opts(
        &self,
        def: &AgentDefinition,
        worker_id: &str,
        session_id: Option<String>,
        extra_env: HashMap<String, String>,
        workspace: Option<String>,
    ) -> GatewayResult<AgentOpts> {
        let mut env: HashMap<String, String> = HashMap::new();
        let mut secret_files: Vec<SecretFileContent> = Vec::new();

        // Store-assigned secrets first (globals plus explicit
        // assignments); definition entries override them below.
        for secret in self.secret_repo.list_for_agent(&def.id).await? {
            match secret.kind {
                SecretKind::String => {
                    match self.vault.decrypt_string(&secret.ciphertext, &secret.nonce) {
                        Ok(value) => {
                            env.insert(env_var_name(&secret.name), value);
                        }
                        Err(e) => {
                            warn!(secret = %secret.name, error = %e, "dropping unreadable secret");
                        }
                    }
                }
                SecretKind::File => {
                    let Some(filename) = secret.filename.clone() else {
                        warn!(secret = %secret.name, "file secret has no filename, skipping");
                        continue;
                    };
                    match self.vault.decrypt(&secret.ciphertext, &secret.nonce) {
                        Ok(content) => secret_files.push(SecretFileContent {
                            target_path: format!("{SECRET_DROP_DIR}/{filename}"),
                            mode: 0o600,
                            content,
                        }),
                        Err(e) => {
                            warn!(secret = %secret.name, error = %e, "dropping unreadable secret");
                        }
                    }
                }
            }
        }

        // Secrets the definition names explicitly.
        for name in &def.secrets {
            match self.open_string_secret(name).await {
                Some(value) => {
                    env.insert(env_var_name(name), value);
                }
                None => warn!(secret = %name, agent_id = %def.id, "secret not resolvable"),
            }
        }

        // Definition env; `secret:<name>` values are resolved, plain
        // values pass through.
        for (key, value) in &def.env {
            match value.strip_prefix(crate::domain::models::agent::SECRET_REF_PREFIX) {
                Some(secret_name) => match self.open_string_secret(secret_name).await {
                    Some(resolved) => {
                        env.insert(key.clone(), resolved);
                    }
                    None => {
                        warn!(secret = %secret_name, var = %key, "omitting env var with unresolvable secret");
                    }
                },
                None => {
                    env.insert(key.clone(), value.clone());
                }
            }
        }

        // Requested file mounts.
        for file in &def.files {
            match self.secret_repo.get(&file.secret_name).await? {
                Some(secret) => match self.vault.decrypt(&secret.ciphertext, &secret.nonce) {
                    Ok(content) => secret_files.push(SecretFileContent {
                        target_path: file.target_path.clone(),
                        mode: file.mode,
                        content,
                    }),
                    Err(e) => {
                        warn!(secret = %file.secret_name, error = %e, "dropping unreadable file secret");
                    }
                },
                None => {
                    warn!(secret = %file.secret_name, agent_id = %def.id, "file secret not found");
                }
            }
        }

        env.extend(extra_env);

        Ok(AgentOpts {
            id: worker_id.to_string(),
            workspace: workspace.unwrap_or_else(|| def.workspace_name().to_string()),
            model: self.registry.resolve_model(def).await,
            image: self.registry.resolve_image(def).await,
            session_id,
            nats_url: self.worker_nats_url.clone(),
            env,
            secret_files,
            allowed_tools: def.allowed_tools.clone(),
            nix_enabled: def.nix_enabled,
            mounts: def.mounts.clone(),
        })
    }

    async fn open_string_secret(&self, name: &str) -> Option<String> {
        let secret = match self.secret_repo.get(name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => return None,
            Err(e) => {
                warn!(secret = %name, error = %e, "secret lookup failed");
                return None;
            }
        };
        match self.vault.decrypt_string(&secret.ciphertext, &secret.nonce) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(secret = %name, error = %e, "secret decryption failed");
                None
            }
        }
    }
}

/// Env var name for a secret: uppercased, non-alphanumerics become `_`.
fn env_var_name(secret_name: &str) -> String {
    secret_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::agent::SecretFile;
    use crate::domain::models::config::Defaults;
    use crate::domain::models::secret::Secret;
    use crate::infrastructure::store::{AgentRepo, StoreConnection};
    use chrono::Utc;

    fn sealed(vault: &Vault, name: &str, value: &str, kind: SecretKind, global: bool) -> Secret {
        let (ciphertext, nonce) = vault.encrypt(value.as_bytes()).unwrap();
        let now = Utc::now();
        Secret {
            name: name.into(),
            description: String::new(),
            kind,
            filename: matches!(kind, SecretKind::File).then(|| format!("{name}.pem")),
            ciphertext,
            nonce,
            global,
            created_at: now,
            updated_at: now,
        }
    }

    async fn provisioner() -> (Provisioner, Arc<SecretRepo>, Vault) {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let secret_repo = Arc::new(SecretRepo::new(db.pool().clone()));
        let agent_repo = Arc::new(AgentRepo::new(db.pool().clone()));
        let registry = Arc::new(Registry::new(
            HashMap::new(),
            Defaults::default(),
            agent_repo,
            "data",
        ));
        let vault = Vault::new("test-pass").unwrap();
        let provisioner = Provisioner::new(
            registry,
            secret_repo.clone(),
            vault.clone(),
            "nats://host.docker.internal:4222",
        );
        (provisioner, secret_repo, vault)
    }

    #[test]
    fn env_var_names_are_sanitized() {
        assert_eq!(env_var_name("github-token"), "GITHUB_TOKEN");
        assert_eq!(env_var_name("API.key2"), "API_KEY2");
    }

    #[tokio::test]
    async fn env_merges_secrets_with_definition_env() {
        let (provisioner, secret_repo, vault) = provisioner().await;
        secret_repo
            .upsert(&sealed(&vault, "github-token", "gh-123", SecretKind::String, true))
            .await
            .unwrap();
        secret_repo
            .upsert(&sealed(&vault, "deploy-key", "KEYDATA", SecretKind::File, false))
            .await
            .unwrap();
        secret_repo.assign("deploy-key", "coder").await.unwrap();

        let def = AgentDefinition {
            id: "coder".into(),
            env: HashMap::from([
                ("PLAIN".to_string(), "1".to_string()),
                ("TOKEN".to_string(), "secret:github-token".to_string()),
            ]),
            files: vec![SecretFile {
                secret_name: "deploy-key".into(),
                target_path: "/home/agent/.ssh/deploy".into(),
                mode: 0o600,
            }],
            ..Default::default()
        };

        let opts = provisioner
            .agent_opts(&def, "coder", Some("sess".into()), HashMap::new(), None)
            .await
            .unwrap();

        assert_eq!(opts.env["PLAIN"], "1");
        assert_eq!(opts.env["TOKEN"], "gh-123");
        assert_eq!(opts.env["GITHUB_TOKEN"], "gh-123");
        // deploy-key lands twice: at its drop path and the requested one.
        assert_eq!(opts.secret_files.len(), 2);
        assert!(opts
            .secret_files
            .iter()
            .any(|f| f.target_path == "/home/agent/.ssh/deploy" && f.content == b"KEYDATA"));
    }

    #[tokio::test]
    async fn missing_secret_is_omitted_not_fatal() {
        let (provisioner, _repo, _vault) = provisioner().await;
        let def = AgentDefinition {
            id: "coder".into(),
            env: HashMap::from([("TOKEN".to_string(), "secret:missing".to_string())]),
            ..Default::default()
        };
        let opts = provisioner
            .agent_opts(&def, "coder", None, HashMap::new(), None)
            .await
            .unwrap();
        assert!(!opts.env.contains_key("TOKEN"));
    }

    #[tokio::test]
    async fn extra_env_overlays() {
        let (provisioner, _repo, _vault) = provisioner().await;
        let def = AgentDefinition {
            id: "coder".into(),
            ..Default::default()
        };
        let opts = provisioner
            .agent_opts(
                &def,
                "swarm-abc-researcher",
                None,
                HashMap::from([("SWARM_ROLE".to_string(), "researcher".to_string())]),
                Some("swarm-abc".into()),
            )
            .await
            .unwrap();
        assert_eq!(opts.id, "swarm-abc-researcher");
        assert_eq!(opts.workspace, "swarm-abc");
        assert_eq!(opts.env["SWARM_ROLE"], "researcher");
    }
}
