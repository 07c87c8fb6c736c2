//! Instance status derived from stored history.

use serde::{Deserialize, Serialize};

use crate::Event;

/// Lifecycle of an orchestration instance, as observable from its history.
/// `Scheduled` means the instance exists but no turn has run yet; `Running`
/// means started and not yet terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    NotFound,
    Scheduled,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }

    /// Derive status from an instance's history. `exists` distinguishes an
    /// unknown instance from one created but not yet started.
    pub(crate) fn from_history(exists: bool, history: &[Event]) -> Self {
        if !exists {
            return OrchestrationStatus::NotFound;
        }
        if history.is_empty() {
            return OrchestrationStatus::Scheduled;
        }
        for event in history.iter().rev() {
            match event {
                Event::OrchestrationCompleted { output } => {
                    return OrchestrationStatus::Completed { output: output.clone() };
                }
                Event::OrchestrationFailed { error } => {
                    return OrchestrationStatus::Failed { error: error.clone() };
                }
                Event::OrchestrationTerminated { reason } => {
                    return OrchestrationStatus::Terminated { reason: reason.clone() };
                }
                _ => {}
            }
        }
        OrchestrationStatus::Running
    }

    /// Terminal payload, if terminal: `Ok(output)` or `Err(error/reason)`.
    pub fn terminal_payload(&self) -> Option<Result<&str, &str>> {
        match self {
            OrchestrationStatus::Completed { output } => Some(Ok(output)),
            OrchestrationStatus::Failed { error } => Some(Err(error)),
            OrchestrationStatus::Terminated { reason } => Some(Err(reason)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_the_last_terminal_event() {
        assert_eq!(OrchestrationStatus::from_history(false, &[]), OrchestrationStatus::NotFound);
        assert_eq!(OrchestrationStatus::from_history(true, &[]), OrchestrationStatus::Scheduled);

        let started = vec![Event::OrchestrationStarted {
            name: "W".into(),
            input: String::new(),
        }];
        assert_eq!(
            OrchestrationStatus::from_history(true, &started),
            OrchestrationStatus::Running
        );

        let mut completed = started.clone();
        completed.push(Event::OrchestrationCompleted { output: "out".into() });
        assert_eq!(
            OrchestrationStatus::from_history(true, &completed),
            OrchestrationStatus::Completed { output: "out".into() }
        );

        let mut terminated = started;
        terminated.push(Event::OrchestrationTerminated { reason: "op".into() });
        assert!(OrchestrationStatus::from_history(true, &terminated).is_terminal());
    }
}
