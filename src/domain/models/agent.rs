//! Static agent definitions, loaded from configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix marking an env value as a vault secret reference
/// (`secret:<name>`).
pub const SECRET_REF_PREFIX: &str = "secret:";

/// A file-mounted secret requested by an agent definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFile {
    /// Name of the vault secret holding the file content.
    pub secret_name: String,
    /// Absolute path inside the worker container.
    pub target_path: String,
    /// File mode; parent directories derive theirs from it.
    #[serde(default = "default_secret_mode")]
    pub mode: u32,
}

fn default_secret_mode() -> u32 {
    0o600
}

/// An extra host directory bound into the worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One configured agent. Loaded at boot, mutated only by config reload,
/// never persisted except as a derived row in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique id (kebab/alnum). Map key in the config file; copied in
    /// during load.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Model override; falls back to `defaults.model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Image override; falls back to `defaults.image`.
    #[serde(default)]
    pub image: Option<String>,
    /// Workspace directory name under `data/agents/`; defaults to the id.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Path to a per-agent memory prompt file.
    #[serde(default)]
    pub claude_md: Option<String>,
    /// Extra environment; values may be `secret:<name>` references.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Names of vault secrets exposed as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Tool allowlist handed to the worker runtime.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Vault secrets written into the container as files.
    #[serde(default)]
    pub files: Vec<SecretFile>,
    /// Extra bind mounts.
    #[serde(default)]
    pub mounts: Vec<FileMount>,
    /// Run the nix daemon inside the worker.
    #[serde(default)]
    pub nix_enabled: bool,
}

impl AgentDefinition {
    /// Workspace directory name for this agent.
    pub fn workspace_name(&self) -> &str {
        self.workspace.as_deref().unwrap_or(&self.id)
    }

    /// Env entries whose values reference vault secrets.
    pub fn secret_env_refs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|(k, v)| {
            v.strip_prefix(SECRET_REF_PREFIX)
                .map(|name| (k.as_str(), name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_defaults_to_id() {
        let def = AgentDefinition {
            id: "coder".into(),
            ..Default::default()
        };
        assert_eq!(def.workspace_name(), "coder");

        let def = AgentDefinition {
            id: "coder".into(),
            workspace: Some("shared".into()),
            ..Default::default()
        };
        assert_eq!(def.workspace_name(), "shared");
    }

    #[test]
    fn secret_env_refs_are_filtered() {
        let mut env = HashMap::new();
        env.insert("PLAIN".to_string(), "value".to_string());
        env.insert("TOKEN".to_string(), "secret:github-token".to_string());
        let def = AgentDefinition {
            id: "a".into(),
            env,
            ..Default::default()
        };
        let refs: Vec<_> = def.secret_env_refs().collect();
        assert_eq!(refs, vec![("TOKEN", "github-token")]);
    }
}
