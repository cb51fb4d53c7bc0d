use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not started, or halted awaiting an operator
    #[default]
    Pending,
    /// At least one stage has been dispatched and the pipeline has not settled
    Running,
    /// Final stage succeeded
    Succeeded,
    /// A stage failed on every work item
    Failed,
    /// A stage finished with a mix of succeeded and failed items
    PartialSuccess,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PartialSuccess)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::PartialSuccess => write!(f, "partial_success"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partial_success" => Ok(Self::PartialSuccess),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Whether the orchestrator chains stages on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Auto,
    Manual,
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid task mode: {s}")),
        }
    }
}

/// Step lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    PartialSuccess,
    /// Operator-initiated stop; resumes on the next invocation
    Interrupted,
}

impl StepStatus {
    /// No executor will touch the step again without an explicit operator action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartialSuccess | Self::Interrupted
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the next stage may be dispatched
    pub fn satisfies_successor(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::PartialSuccess => write!(f, "partial_success"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partial_success" => Ok(Self::PartialSuccess),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}

/// Per-feature work item sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    /// Dispatched, or queued remotely when an external job id is present
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Still owes work to the step: pending, running, or waiting to resume
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Interrupted)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Invalid item status: {s}")),
        }
    }
}

/// Slot lease states. Only `Active` counts against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Active,
    Released,
    Error,
    Timeout,
    Expired,
}

impl SlotStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Statuses a holder may release into
    pub fn is_release_status(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Released => write!(f, "released"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid slot status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_step_status_round_trips_through_strings() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::PartialSuccess,
            StepStatus::Interrupted,
        ] {
            assert_eq!(StepStatus::from_str(&status.to_string()).unwrap(), status);
        }
        assert!(StepStatus::from_str("done").is_err());
    }

    #[test]
    fn test_step_terminal_states() {
        assert!(StepStatus::Interrupted.is_terminal());
        assert!(StepStatus::PartialSuccess.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Succeeded.satisfies_successor());
        assert!(!StepStatus::PartialSuccess.satisfies_successor());
    }

    #[test]
    fn test_item_in_flight() {
        assert!(ItemStatus::Interrupted.is_in_flight());
        assert!(ItemStatus::Running.is_in_flight());
        assert!(!ItemStatus::Failed.is_in_flight());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
        let slot: SlotStatus = serde_json::from_str("\"expired\"").unwrap();
        assert_eq!(slot, SlotStatus::Expired);
    }
}
