//! Gateway configuration model.
//!
//! Deserialized from the YAML config file and merged with the
//! `PRAKTOR_*` environment override layer by the loader.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::agent::AgentDefinition;

/// Top-level configuration. Every section has serde defaults so a minimal
/// file (vault passphrase plus one agent) boots a working gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub agents: HashMap<String, AgentDefinition>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    /// Root of all persisted state (store, bus data, agent workspaces).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Config {
    /// Agents map with map keys copied into each definition's `id`.
    pub fn agents_with_ids(&self) -> HashMap<String, AgentDefinition> {
        self.agents
            .iter()
            .map(|(id, def)| {
                let mut def = def.clone();
                def.id = id.clone();
                (id.clone(), def)
            })
            .collect()
    }
}

/// Chat adapter settings. The adapter itself is an external collaborator;
/// the core only threads `main_chat_id` into scheduler metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub allow_from: Vec<i64>,
    #[serde(default)]
    pub main_chat_id: Option<i64>,
}

/// Fleet-wide defaults, overridable per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Hard cap on simultaneously running worker containers.
    #[serde(default = "default_max_running")]
    pub max_running: usize,
    /// Idle eviction threshold in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub oauth_token: Option<String>,
    /// Timezone handed to workers as `TZ`.
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_image() -> String {
    "praktor-worker:latest".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_running() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            image: default_image(),
            model: default_model(),
            max_running: default_max_running(),
            idle_timeout_secs: default_idle_timeout_secs(),
            anthropic_api_key: None,
            oauth_token: None,
            timezone: None,
        }
    }
}

impl Defaults {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Required iff `agents` is nonempty.
    #[serde(default)]
    pub default_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_port")]
    pub port: u16,
    /// JetStream-style durable directory; defaults to `{data_dir}/nats`.
    #[serde(default)]
    pub data_dir: Option<String>,
}

fn default_nats_port() -> u16 {
    4222
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            port: default_nats_port(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: Option<String>,
}

fn default_web_port() -> u16 {
    8080
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Required. Key material for the AEAD vault.
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// json, pretty
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional directory for rotated file output.
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
        }
    }
}
