//! Demo handlers for `streamq work`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use streamq_core::domain::TaskId;
use streamq_core::{Handler, HandlerError, Outcome, Task, TaskHandler, TaskPayload};

/// Logs the payload and succeeds.
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        tracing::info!(task_id = %task.id, data = %task.data, "log handler");
        Ok(Outcome::success())
    }
}

#[derive(Debug, serde::Serialize, Deserialize)]
pub struct FlakyPayload {
    /// Attempts to fail (per task id, per worker process) before succeeding.
    #[serde(default = "default_failures")]
    pub failures: u32,
}

fn default_failures() -> u32 {
    1
}

impl TaskPayload for FlakyPayload {
    const HANDLER: &'static str = "flaky";
}

/// Fails the first `failures` attempts of each task, then succeeds.
#[derive(Default)]
pub struct FlakyHandler {
    attempts: Mutex<HashMap<TaskId, u32>>,
}

#[async_trait]
impl Handler<FlakyPayload> for FlakyHandler {
    async fn handle(&self, payload: FlakyPayload, task: &Task) -> Result<Outcome, HandlerError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let seen = attempts.entry(task.id).or_insert(0);
            *seen += 1;
            *seen
        };

        if attempt <= payload.failures {
            return Ok(Outcome::failure(format!(
                "planned failure {attempt}/{}",
                payload.failures
            )));
        }
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task.id);
        Ok(Outcome::success())
    }
}
