//! Error taxonomy for the praktor gateway.

use thiserror::Error;

/// Errors surfaced by the gateway core.
///
/// Chat-facing callers never see these directly; they receive a canned
/// apology while the structured error goes to logs and `events.*` topics.
#[derive(Debug, Error)]
pub enum GatewayError {
    // -- Config errors: fatal at boot, logged on reload --
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    #[error("missing required configuration field: {0}")]
    MissingField(String),

    // -- Transient transport errors --
    #[error("bus publish failed on {subject}: {reason}")]
    BusPublish { subject: String, reason: String },

    #[error("bus request on {subject} timed out")]
    BusTimeout { subject: String },

    #[error("docker api error during {stage}: {reason}")]
    DockerApi { stage: String, reason: String },

    // -- State errors: returned to the caller, never retried --
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown swarm role: {0}")]
    UnknownRole(String),

    #[error("swarm graph contains a cycle")]
    CycleDetected,

    #[error("no default agent configured")]
    NoDefault,

    #[error("max running containers reached ({0})")]
    MaxRunningExceeded(usize),

    // -- Worker errors --
    #[error("failed to start worker for agent {agent_id}: {reason}")]
    StartFailed { agent_id: String, reason: String },

    #[error("worker {agent_id} did not respond in time")]
    WorkerTimeout { agent_id: String },

    #[error("worker {agent_id} returned an error: {reason}")]
    ResultError { agent_id: String, reason: String },

    // -- Schedule errors --
    #[error("invalid schedule: {0}")]
    BadSchedule(String),

    // -- Vault errors --
    #[error("vault key rejected the ciphertext")]
    BadKey,

    #[error("malformed ciphertext or nonce")]
    BadCiphertext,

    // -- Store --
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// The canned reply shown to chat users when a worker-side error
    /// reaches the chat adapter.
    pub const CHAT_APOLOGY: &'static str =
        "Sorry, I encountered an error while processing your request.";

    /// True for errors that may succeed on a retry of the same call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BusPublish { .. } | Self::BusTimeout { .. } | Self::DockerApi { .. }
        )
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}
