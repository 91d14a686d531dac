//! Persisted vault secrets.
//!
//! Only name and metadata leave the store in plaintext; ciphertext is
//! opened solely when the orchestrator materializes a worker environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// Exposed as an environment variable value.
    String,
    /// Written into the container as a file.
    File,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::File => "file",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// A sealed secret row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Unique name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: SecretKind,
    /// Default file name when materialized as a file mount.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(skip_serializing)]
    pub ciphertext: Vec<u8>,
    #[serde(skip_serializing)]
    pub nonce: Vec<u8>,
    /// Globally assigned to every agent.
    pub global: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
