//! Saga and step state machines.

use saga_store::RecordStatus;
use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Completed
///           └──► Compensating ──► Failed
/// ```
/// A failure on the first step with nothing to undo goes straight from
/// Pending to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Steps are being dispatched one at a time.
    #[default]
    Pending,

    /// A step failed and completed steps are being undone in reverse.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed and compensation has finished (terminal state).
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "Pending",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
        }
    }

    /// Column value stored alongside the saga row.
    pub fn record_status(&self) -> RecordStatus {
        match self {
            SagaStatus::Pending => RecordStatus::Active,
            SagaStatus::Compensating => RecordStatus::Compensating,
            SagaStatus::Completed => RecordStatus::Completed,
            SagaStatus::Failed => RecordStatus::Failed,
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of one step.
///
/// ```text
/// Pending ──► Dispatched ──► Completed ──► Compensated
///                  │
///                  └──► Failed
/// ```
/// Steps after a failed step never run; they are marked Compensated when
/// the saga terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Dispatched,
    Completed,
    Failed,
    Compensated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Dispatched => "Dispatched",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensated => "Compensated",
        }
    }

    /// Statuses a step may hold once its saga is terminal.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Compensated
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
