use super::states::StepStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events that drive step transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "status", rename_all = "snake_case")]
pub enum StepEvent {
    /// Executor begins (or resumes) processing
    Start,
    /// Executor settled the step with an aggregated status
    Settle(StepStatus),
    /// Operator interrupt
    Interrupt,
    /// Operator retry; counts against `max_retries`
    Retry,
    /// Recovery reset; does not count against `max_retries`
    Reset,
}

impl fmt::Display for StepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Settle(status) => write!(f, "settle({status})"),
            Self::Interrupt => write!(f, "interrupt"),
            Self::Retry => write!(f, "retry"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Outcome of one provider round for a single work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResolution {
    Completed,
    Queued,
    Failed,
}

/// Events that drive a work item's per-feature sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "resolution", rename_all = "snake_case")]
pub enum ItemEvent {
    Dispatch,
    Resolve(ItemResolution),
    Interrupt,
    /// Next invocation picks an interrupted or abandoned item back up
    Resume,
    /// Operator-requested re-run of a single item
    Reset,
}

impl fmt::Display for ItemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Resolve(ItemResolution::Completed) => write!(f, "resolve(completed)"),
            Self::Resolve(ItemResolution::Queued) => write!(f, "resolve(queued)"),
            Self::Resolve(ItemResolution::Failed) => write!(f, "resolve(failed)"),
            Self::Interrupt => write!(f, "interrupt"),
            Self::Resume => write!(f, "resume"),
            Self::Reset => write!(f, "reset"),
        }
    }
}
