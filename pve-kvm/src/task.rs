use crate::api::{ProxmoxApi, TaskHandle};
use crate::error::KvmError;
use anyhow::Result;
use std::time::Duration;
use tokio::time::Instant;

/// How long and how often to poll a cluster task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Log lines attached to a failure.
    pub log_tail_lines: usize,
}

impl Default for TaskWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            log_tail_lines: 10,
        }
    }
}

/// Block until `task` stops. Succeeds only on exit status `OK`.
pub async fn wait_for_task(api: &dyn ProxmoxApi, task: &TaskHandle, wait: &TaskWait) -> Result<()> {
    let deadline = Instant::now() + wait.timeout;

    loop {
        let status = api.task_status(task).await?;
        if status.is_finished() {
            if status.is_success() {
                tracing::debug!("Task {} finished OK", task);
                return Ok(());
            }
            let reason = match status.exitstatus.as_deref() {
                Some(exit) => format!("failed with status: {}", exit),
                None => "stopped without exit status".to_string(),
            };
            return Err(task_error(api, task, reason, wait).await.into());
        }

        if Instant::now() >= deadline {
            let reason = format!("timed out after {} seconds", wait.timeout.as_secs());
            return Err(task_error(api, task, reason, wait).await.into());
        }

        tokio::time::sleep(wait.poll_interval).await;
    }
}

async fn task_error(api: &dyn ProxmoxApi, task: &TaskHandle, reason: String, wait: &TaskWait) -> KvmError {
    let log_tail = match api.task_log(task, wait.log_tail_lines).await {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!("Failed to fetch log of task {}: {:#}", task, e);
            Vec::new()
        }
    };
    tracing::warn!("Task {} {}", task, reason);
    KvmError::Task {
        upid: task.upid().to_string(),
        reason,
        log_tail,
    }
}
