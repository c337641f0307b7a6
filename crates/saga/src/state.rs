//! Saga and step status state machines.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// InProgress ──┬──► Completed
///              ├──► Failed              (every required compensation succeeded)
///              └──► PartiallyCompleted  (some, but not all, compensations succeeded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps or compensations are still running.
    #[default]
    InProgress,

    /// All steps succeeded (terminal state).
    Completed,

    /// A step failed and compensation finished (terminal state).
    Failed,

    /// A step failed and compensation only partly succeeded (terminal state).
    PartiallyCompleted,
}

impl SagaStatus {
    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaStatus::InProgress)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::PartiallyCompleted => "partially_completed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single step.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Success ──► Compensated
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Compensated,
}

impl StepStatus {
    /// Returns true if a step may move from `self` to `next`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Success)
                | (StepStatus::Pending, StepStatus::Failed)
                | (StepStatus::Success, StepStatus::Compensated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
