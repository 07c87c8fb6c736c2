//! Submission-side API: enqueue commands and orchestrations, query status,
//! terminate, and await results.
//!
//! The client only talks to the provider; it never executes workflow code.
//! Submission is accept-and-return: the handle comes back as soon as the
//! start item is durably enqueued, while the runtime picks the work up
//! asynchronously.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::commands::{Command, CommandResult, CommandState};
use crate::providers::{Provider, ProviderError, QueueKind, WorkItem};
use crate::runtime::OrchestrationStatus;

/// Identifies a submitted orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("storage failure: {0}")]
    Storage(#[from] ProviderError),
    #[error("payload encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance {instance}")]
    Timeout { instance: String },
    #[error("{0}")]
    Other(String),
}

const WAIT_POLL_MS: u64 = 25;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Submit a command for asynchronous execution. Returns as soon as the
    /// start item is enqueued; poll [`Client::status`] or wait on
    /// [`Client::wait_for_command_result`] for the outcome.
    pub async fn submit_command(&self, command: &Command) -> Result<InstanceHandle, ClientError> {
        let instance = command.instance_id();
        let input = serde_json::to_string(command)?;
        self.start_orchestration(&instance, command.orchestration(), input).await
    }

    /// Start a named orchestration under an explicit instance id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<InstanceHandle, ClientError> {
        self.store.create_instance(instance).await?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input: input.into(),
                },
                None,
            )
            .await?;
        debug!(instance, orchestration, "orchestration submitted");
        Ok(InstanceHandle {
            instance: instance.to_string(),
        })
    }

    pub async fn status(&self, instance: &str) -> OrchestrationStatus {
        let exists = self.store.instance_exists(instance).await;
        let history = self.store.read(instance).await;
        OrchestrationStatus::from_history(exists, &history)
    }

    /// Request termination of a running instance. Delivery is asynchronous;
    /// an already-finished instance ignores the request.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Poll until the instance reaches a terminal status, or time out.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout {
                    instance: instance.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(WAIT_POLL_MS)).await;
        }
    }

    /// The command's result envelope, if its instance has finished. Payloads
    /// that never reached workflow code (unregistered orchestration,
    /// termination) come back as synthesized envelopes.
    pub async fn command_result(&self, command_id: &str, instance: &str) -> Option<CommandResult> {
        let status = self.status(instance).await;
        match &status {
            OrchestrationStatus::Terminated { reason } => Some(
                CommandResult::from_terminal_payload(reason).unwrap_or_else(|| {
                    CommandResult::synthesized(command_id, CommandState::Terminated, format!("terminated: {reason}"))
                }),
            ),
            _ => {
                let payload = status.terminal_payload()?;
                let (raw, state) = match payload {
                    Ok(output) => (output, CommandState::Completed),
                    Err(error) => (error, CommandState::Failed),
                };
                Some(
                    CommandResult::from_terminal_payload(raw)
                        .unwrap_or_else(|| CommandResult::synthesized(command_id, state, raw)),
                )
            }
        }
    }

    /// Wait for a submitted command's terminal envelope.
    pub async fn wait_for_command_result(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResult, WaitError> {
        let instance = command.instance_id();
        self.wait_for_orchestration(&instance, timeout).await?;
        self.command_result(command.command_id(), &instance)
            .await
            .ok_or_else(|| WaitError::Other(format!("no terminal envelope for {instance}")))
    }
}
