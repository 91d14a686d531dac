//! Loads the gateway configuration file and applies the environment
//! override layer.

use anyhow::{Context, Result};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use std::env;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Env var naming the config file path.
pub const CONFIG_PATH_ENV: &str = "PRAKTOR_CONFIG";
/// Default config file path when neither flag nor env var is set.
pub const DEFAULT_CONFIG_PATH: &str = "praktor.yaml";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("vault.passphrase is required (or set PRAKTOR_VAULT_PASSPHRASE)")]
    MissingPassphrase,

    #[error("router.default_agent is required when agents are configured")]
    MissingDefaultAgent,

    #[error("router.default_agent '{0}' is not a configured agent")]
    UnknownDefaultAgent(String),

    #[error("invalid agent id '{0}': only lowercase alphanumerics and '-' are allowed")]
    InvalidAgentId(String),

    #[error("defaults.max_running must be at least 1")]
    InvalidMaxRunning,

    #[error("scheduler.poll_interval_secs must be at least 1")]
    InvalidPollInterval,

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Configuration loader with YAML file + environment override layering.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the config path: explicit flag, then `PRAKTOR_CONFIG`,
    /// then `praktor.yaml`.
    pub fn resolve_path(flag: Option<&str>) -> String {
        flag.map(String::from)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load configuration from a file with programmatic defaults and the
    /// `PRAKTOR_*` environment override layer applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::apply_env_overrides(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load without validation. The reloader uses this to compute diffs
    /// before deciding whether the new file is acceptable.
    pub fn load_unvalidated(path: impl AsRef<Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "failed to load config from {}",
                path.as_ref().display()
            ))?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// The override names are historical and non-uniform, so they are
    /// applied explicitly rather than through a figment Env provider.
    fn apply_env_overrides(config: &mut Config) {
        if let Ok(v) = env::var("PRAKTOR_TELEGRAM_TOKEN") {
            config.telegram.token = Some(v);
        }
        if let Ok(v) = env::var("ANTHROPIC_API_KEY") {
            config.defaults.anthropic_api_key = Some(v);
        }
        if let Ok(v) = env::var("CLAUDE_CODE_OAUTH_TOKEN") {
            config.defaults.oauth_token = Some(v);
        }
        if let Ok(v) = env::var("PRAKTOR_AGENT_MODEL") {
            config.defaults.model = v;
        }
        if let Ok(v) = env::var("PRAKTOR_WEB_PASSWORD") {
            config.web.auth = Some(v);
        }
        if let Ok(v) = env::var("PRAKTOR_WEB_PORT") {
            if let Ok(port) = v.parse() {
                config.web.port = port;
            }
        }
        if let Ok(v) = env::var("PRAKTOR_NATS_PORT") {
            if let Ok(port) = v.parse() {
                config.nats.port = port;
            }
        }
        if let Ok(v) = env::var("PRAKTOR_VAULT_PASSPHRASE") {
            config.vault.passphrase = Some(v);
        }
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config
            .vault
            .passphrase
            .as_deref()
            .is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingPassphrase);
        }

        for id in config.agents.keys() {
            let ok = !id.is_empty()
                && id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !ok {
                return Err(ConfigError::InvalidAgentId(id.clone()));
            }
        }

        if !config.agents.is_empty() {
            match config.router.default_agent.as_deref() {
                None | Some("") => return Err(ConfigError::MissingDefaultAgent),
                Some(agent) if !config.agents.contains_key(agent) => {
                    return Err(ConfigError::UnknownDefaultAgent(agent.to_string()));
                }
                Some(_) => {}
            }
        }

        if config.defaults.max_running == 0 {
            return Err(ConfigError::InvalidMaxRunning);
        }

        if config.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
