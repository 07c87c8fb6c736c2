//! Command envelopes: the unit of work submitted to the engine.
//!
//! A [`Command`] is an immutable, tagged operation; its [`CommandResult`] is
//! the mutable accumulator the owning workflow writes into and always emits
//! at termination. Callers never observe an unhandled fault from a running
//! orchestration, only a terminal envelope.

use serde::{Deserialize, Serialize};

use crate::data::ProviderRecord;

/// Orchestration names the shipped commands map onto.
pub mod workflows {
    pub const PROVIDER_UPDATE: &str = "ProviderUpdate";
    pub const PROVIDER_REGISTER: &str = "ProviderRegister";
    pub const USER_DELETE: &str = "UserDelete";
    pub const PROJECT_USER_DELETE: &str = "ProjectUserDelete";
}

/// A typed operation plus its payload. The `command_id` is supplied by the
/// caller so submission is idempotent and the engine never has to invent an
/// identifier outside the recorded system-call path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Command {
    UpdateProvider {
        command_id: String,
        provider: ProviderRecord,
    },
    RegisterProvider {
        command_id: String,
        provider: ProviderRecord,
    },
    DeleteUser {
        command_id: String,
        user_id: String,
    },
    DeleteProjectUser {
        command_id: String,
        project_id: String,
        user_id: String,
    },
}

impl Command {
    pub fn command_id(&self) -> &str {
        match self {
            Command::UpdateProvider { command_id, .. }
            | Command::RegisterProvider { command_id, .. }
            | Command::DeleteUser { command_id, .. }
            | Command::DeleteProjectUser { command_id, .. } => command_id,
        }
    }

    /// Name of the workflow that executes this command.
    pub fn orchestration(&self) -> &'static str {
        match self {
            Command::UpdateProvider { .. } => workflows::PROVIDER_UPDATE,
            Command::RegisterProvider { .. } => workflows::PROVIDER_REGISTER,
            Command::DeleteUser { .. } => workflows::USER_DELETE,
            Command::DeleteProjectUser { .. } => workflows::PROJECT_USER_DELETE,
        }
    }

    /// Deterministic orchestration instance id for this command.
    pub fn instance_id(&self) -> String {
        format!("command-{}", self.command_id())
    }
}

/// Terminal disposition of a command's orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Completed,
    Failed,
    Terminated,
}

/// Mutable result accumulator bound 1:1 to a command.
///
/// Exactly one envelope is emitted per orchestration instance, on every exit
/// path; [`CommandResult::into_output`] is the single authorized
/// finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub value: Option<serde_json::Value>,
    pub errors: Vec<String>,
    pub state: CommandState,
}

impl CommandResult {
    /// Empty result bound to the command's identity.
    pub fn for_command(command: &Command) -> Self {
        Self {
            command_id: command.command_id().to_string(),
            value: None,
            errors: Vec::new(),
            state: CommandState::Completed,
        }
    }

    /// Append a captured error; prior errors are never discarded.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.state = CommandState::Failed;
    }

    pub fn set_value(&mut self, value: serde_json::Value) {
        self.value = Some(value);
    }

    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Finalize the envelope into the workflow's terminal output: `Ok` with
    /// the serialized envelope when no errors were captured, `Err` with the
    /// serialized envelope otherwise. Every workflow exit path routes
    /// through this, so the terminal history event always carries the
    /// envelope.
    pub fn into_output(mut self) -> Result<String, String> {
        self.state = if self.errors.is_empty() {
            CommandState::Completed
        } else {
            CommandState::Failed
        };
        let json = serde_json::to_string(&self)
            .unwrap_or_else(|e| format!("{{\"command_id\":\"{}\",\"errors\":[\"serialize: {e}\"]}}", self.command_id));
        if self.errors.is_empty() { Ok(json) } else { Err(json) }
    }

    /// Parse a terminal envelope back out of an orchestration output or
    /// error payload. Returns `None` when the payload is not an envelope
    /// (infrastructure failure), in which case the caller synthesizes one.
    pub fn from_terminal_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }

    /// Synthesized envelope for failures that never reached workflow code
    /// (unregistered orchestration, termination, corrupted state).
    pub fn synthesized(command_id: impl Into<String>, state: CommandState, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            value: None,
            errors: vec![error.into()],
            state,
        }
    }
}
