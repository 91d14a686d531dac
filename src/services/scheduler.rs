//! Fires persisted tasks when their next-run time comes due.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::orchestrator::Orchestrator;
use crate::domain::errors::GatewayResult;
use crate::domain::models::task::{ScheduledTask, TaskRunStatus, TaskStatus};
use crate::infrastructure::bus::topics::{self, EventPayload};
use crate::infrastructure::bus::Bus;
use crate::infrastructure::store::TaskRepo;

struct SchedulerState {
    poll_interval: Duration,
    main_chat_id: Option<i64>,
}

pub struct Scheduler {
    task_repo: Arc<TaskRepo>,
    orchestrator: Arc<Orchestrator>,
    bus: Bus,
    state: Mutex<SchedulerState>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: Mutex<mpsc::Receiver<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        task_repo: Arc<TaskRepo>,
        orchestrator: Arc<Orchestrator>,
        bus: Bus,
        poll_interval: Duration,
        main_chat_id: Option<i64>,
        cancel: CancellationToken,
    ) -> Self {
        // 1-slot channel: a pending signal is enough, extra ones drop.
        let (reload_tx, reload_rx) = mpsc::channel(1);
        Self {
            task_repo,
            orchestrator,
            bus,
            state: Mutex::new(SchedulerState {
                poll_interval,
                main_chat_id,
            }),
            reload_tx,
            reload_rx: Mutex::new(reload_rx),
            cancel,
        }
    }

    /// Swap poll interval / chat id; the loop picks the new interval up
    /// on its next iteration without losing the current window.
    pub async fn update_config(&self, poll_interval: Duration, main_chat_id: Option<i64>) {
        {
            let mut state = self.state.lock().await;
            state.poll_interval = poll_interval;
            state.main_chat_id = main_chat_id;
        }
        let _ = self.reload_tx.try_send(());
    }

    pub async fn run(self: Arc<Self>) {
        info!("scheduler started");
        let mut reload_rx = self.reload_rx.lock().await;
        loop {
            let poll_interval = self.state.lock().await.poll_interval;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = reload_rx.recv() => {
                    debug!("scheduler config updated, resetting ticker");
                    continue;
                }
                () = tokio::time::sleep(poll_interval) => {}
            }
            if let Err(e) = self.fire_due().await {
                warn!(error = %e, "scheduler pass failed");
            }
        }
        info!("scheduler stopped");
    }

    /// Fire every due task once. Tasks fire sequentially within a pass,
    /// so a task id can never fire concurrently with itself.
    async fn fire_due(&self) -> GatewayResult<()> {
        let now = Utc::now();
        let due = self.task_repo.list_due(now).await?;
        for task in due {
            self.fire(task).await;
        }
        Ok(())
    }

    async fn fire(&self, task: ScheduledTask) {
        let main_chat_id = self.state.lock().await.main_chat_id;
        let mut meta = json!({
            "sender": "scheduler",
            "task_id": task.id,
        });
        if let Some(chat_id) = main_chat_id {
            meta["chat_id"] = json!(chat_id);
        }

        let outcome = self
            .orchestrator
            .handle_message(&task.agent_id, &task.prompt, meta)
            .await;

        let now = Utc::now();
        let (run_status, last_error) = match &outcome {
            Ok(()) => (TaskRunStatus::Success, None),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "scheduled task failed");
                (TaskRunStatus::Error, Some(e.to_string()))
            }
        };

        // A failed fire neither pauses nor disables the task; it runs
        // again at its next tick.
        let next_run_at = match task.schedule.next_run(now) {
            Ok(next) => next,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "next-run computation failed");
                None
            }
        };
        let status = if next_run_at.is_none() {
            TaskStatus::Completed
        } else {
            task.status
        };

        if let Err(e) = self
            .task_repo
            .record_fire(
                task.id,
                status,
                run_status,
                last_error.as_deref(),
                now,
                next_run_at,
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "failed to record task fire");
        }

        let event = EventPayload::new(
            "task_executed",
            json!({
                "id": task.id,
                "name": task.name,
                "status": run_status,
                "timestamp": now,
            }),
        );
        if let Err(e) = self.bus.publish(topics::EVENTS_TASK_EXECUTED, &event).await {
            debug!(task_id = %task.id, error = %e, "failed to publish task event");
        }
    }
}
