//! Embedded message bus.
//!
//! One `nats-server` child process owned by the gateway plus cloned
//! client handles for every caller. The broker's durable directory backs
//! JetStream-style use; the core itself only touches non-durable
//! subjects.

pub mod topics;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::domain::errors::{GatewayError, GatewayResult};

/// Deadline for request/reply over `host.ipc.*`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const PUBLISH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// The broker child process. Dropping does not kill it; call
/// [`BusServer::shutdown`] during ordered shutdown.
pub struct BusServer {
    child: Child,
    client_url: String,
    worker_url: String,
    monitor_url: String,
}

impl BusServer {
    /// Spawn `nats-server` with its durable directory under `data_dir`.
    ///
    /// The monitoring endpoint (client-count probe) listens one port
    /// above the client port.
    pub async fn spawn(port: u16, data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).context("failed to create bus data dir")?;
        let monitor_port = port
            .checked_add(1)
            .context("nats port too high for the monitoring port")?;

        // Bound on all interfaces so workers can reach the broker over
        // the host gateway; the monitoring port stays loopback-only use.
        let child = Command::new("nats-server")
            .arg("-p")
            .arg(port.to_string())
            .arg("-m")
            .arg(monitor_port.to_string())
            .arg("-js")
            .arg("-sd")
            .arg(data_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn nats-server (is it installed?)")?;

        let server = Self {
            child,
            client_url: format!("nats://127.0.0.1:{port}"),
            worker_url: format!("nats://host.docker.internal:{port}"),
            monitor_url: format!("http://127.0.0.1:{monitor_port}"),
        };
        server.wait_ready().await?;
        info!(url = %server.client_url, "bus broker started");
        Ok(server)
    }

    async fn wait_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match async_nats::connect(&self.client_url).await {
                Ok(probe) => {
                    drop(probe);
                    return Ok(());
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(e)).context("bus broker did not become ready");
                }
            }
        }
    }

    pub fn client_url(&self) -> &str {
        &self.client_url
    }

    /// Broker URL as seen from inside a worker container.
    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }

    pub fn monitor_url(&self) -> &str {
        &self.monitor_url
    }

    /// Kill the broker process.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill bus broker");
        }
        let _ = self.child.wait().await;
    }
}

/// A caller's handle onto the bus. Cheap to clone; connections are
/// long-lived and safely shared across tasks.
#[derive(Clone)]
pub struct Bus {
    client: async_nats::Client,
    monitor_url: String,
    http: reqwest::Client,
}

impl Bus {
    /// Connect a new client handle.
    pub async fn connect(client_url: &str, monitor_url: &str) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .request_timeout(Some(REQUEST_TIMEOUT))
            .connect(client_url)
            .await
            .context("failed to connect to bus")?;
        Ok(Self {
            client,
            monitor_url: monitor_url.to_string(),
            http: reqwest::Client::new(),
        })
    }

    /// Fire-and-forget JSON publish.
    pub async fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> GatewayResult<()> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        self.client
            .publish(subject.to_string(), bytes)
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    /// Publish with a single retry after a short backoff.
    pub async fn publish_retry<T: Serialize>(
        &self,
        subject: &str,
        payload: &T,
    ) -> GatewayResult<()> {
        match self.publish(subject, payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(subject, error = %first, "publish failed, retrying once");
                tokio::time::sleep(PUBLISH_RETRY_BACKOFF).await;
                self.publish(subject, payload).await
            }
        }
    }

    /// Publish raw bytes (reply forwarding).
    pub async fn publish_bytes(&self, subject: &str, bytes: Bytes) -> GatewayResult<()> {
        self.client
            .publish(subject.to_string(), bytes)
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    /// At-most-once subscription.
    pub async fn subscribe(&self, subject: &str) -> GatewayResult<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    /// Request/reply with the configured deadline; the reply is decoded
    /// as JSON.
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        subject: &str,
        payload: &T,
    ) -> GatewayResult<R> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        let message = self
            .client
            .request(subject.to_string(), bytes)
            .await
            .map_err(|e| match e.kind() {
                async_nats::RequestErrorKind::TimedOut => GatewayError::BusTimeout {
                    subject: subject.to_string(),
                },
                _ => GatewayError::BusPublish {
                    subject: subject.to_string(),
                    reason: e.to_string(),
                },
            })?;
        Ok(serde_json::from_slice(&message.payload)?)
    }

    /// Flush pending publishes to the broker.
    pub async fn flush(&self) -> GatewayResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: "<flush>".to_string(),
                reason: e.to_string(),
            })
    }

    /// Best-effort count of connected clients, read from the broker's
    /// monitoring endpoint. Never a correctness gate; the orchestrator
    /// uses it only to bound its container-ready wait.
    pub async fn num_clients(&self) -> GatewayResult<u64> {
        let url = format!("{}/varz", self.monitor_url);
        let varz: serde_json::Value = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: "<varz>".to_string(),
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| GatewayError::BusPublish {
                subject: "<varz>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(varz
            .get("connections")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("monitor_url", &self.monitor_url)
            .finish_non_exhaustive()
    }
}
