//! Task status state machine.
//!
//! Every task carries a [`TaskStatus`]. Rendering moves a task out of
//! [`TaskStatus::WaitingRender`]; building or propagation moves it into a
//! terminal state. `Executed` and `Skipped` are the two states that count
//! as ready for downstream evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task within one build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Initial state: the task has not been rendered yet.
    WaitingRender,

    /// Rendered and outdated (or forced): ready to execute.
    WaitingExecution,

    /// Rendered, but at least one upstream task is not ready yet.
    WaitingUpstream,

    /// Rendered and up to date: nothing to do this session.
    Skipped,

    /// The task's work ran and its products were finalized.
    Executed,

    /// The task's work (or finish sequence) failed.
    Errored,

    /// Rendering the task's product or source failed.
    ErroredRender,

    /// An upstream task errored or was aborted; this task will not run.
    Aborted,

    /// An upstream task failed to render; this task will not run.
    AbortedRender,

    /// Placeholder terminal state reported by executors whose worker pool
    /// died. The engine never sets it and defines no transitions over it.
    BrokenProcessPool,
}

impl TaskStatus {
    /// Whether downstream tasks may treat this task as done.
    pub fn is_ready(self) -> bool {
        matches!(self, TaskStatus::Executed | TaskStatus::Skipped)
    }

    /// Whether this status is final for the current build session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Skipped
                | TaskStatus::Executed
                | TaskStatus::Errored
                | TaskStatus::ErroredRender
                | TaskStatus::Aborted
                | TaskStatus::AbortedRender
                | TaskStatus::BrokenProcessPool
        )
    }

    /// Whether this status marks a failed run or a downstream abort of one.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Errored | TaskStatus::Aborted)
    }

    /// Whether this status marks a failed render or a downstream abort of one.
    pub fn is_render_failure(self) -> bool {
        matches!(self, TaskStatus::ErroredRender | TaskStatus::AbortedRender)
    }

    /// Statuses an executor may apply externally through the status setter.
    pub fn is_settable(self) -> bool {
        matches!(self, TaskStatus::Executed | TaskStatus::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::WaitingRender => "waiting_render",
            TaskStatus::WaitingExecution => "waiting_execution",
            TaskStatus::WaitingUpstream => "waiting_upstream",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Executed => "executed",
            TaskStatus::Errored => "errored",
            TaskStatus::ErroredRender => "errored_render",
            TaskStatus::Aborted => "aborted",
            TaskStatus::AbortedRender => "aborted_render",
            TaskStatus::BrokenProcessPool => "broken_process_pool",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed from the same snake_case strings `Display` produces.
impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_render" => Ok(TaskStatus::WaitingRender),
            "waiting_execution" => Ok(TaskStatus::WaitingExecution),
            "waiting_upstream" => Ok(TaskStatus::WaitingUpstream),
            "skipped" => Ok(TaskStatus::Skipped),
            "executed" => Ok(TaskStatus::Executed),
            "errored" => Ok(TaskStatus::Errored),
            "errored_render" => Ok(TaskStatus::ErroredRender),
            "aborted" => Ok(TaskStatus::Aborted),
            "aborted_render" => Ok(TaskStatus::AbortedRender),
            "broken_process_pool" => Ok(TaskStatus::BrokenProcessPool),
            other => Err(format!("unknown task status: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_states_are_not_terminal() {
        assert!(!TaskStatus::WaitingRender.is_terminal());
        assert!(!TaskStatus::WaitingExecution.is_terminal());
        assert!(!TaskStatus::WaitingUpstream.is_terminal());
    }

    #[test]
    fn test_outcome_states_are_terminal() {
        for status in [
            TaskStatus::Skipped,
            TaskStatus::Executed,
            TaskStatus::Errored,
            TaskStatus::ErroredRender,
            TaskStatus::Aborted,
            TaskStatus::AbortedRender,
            TaskStatus::BrokenProcessPool,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_only_executed_and_skipped_are_ready() {
        assert!(TaskStatus::Executed.is_ready());
        assert!(TaskStatus::Skipped.is_ready());
        assert!(!TaskStatus::Errored.is_ready());
        assert!(!TaskStatus::WaitingExecution.is_ready());
    }

    #[test]
    fn test_settable_statuses() {
        assert!(TaskStatus::Executed.is_settable());
        assert!(TaskStatus::Errored.is_settable());
        assert!(!TaskStatus::Skipped.is_settable());
        assert!(!TaskStatus::BrokenProcessPool.is_settable());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        let status = TaskStatus::AbortedRender;
        let parsed: TaskStatus = status.to_string().parse().unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
