//! Pure transition tables for steps and work item sub-states.
//!
//! Persistence layers call these before writing so an illegal move is rejected
//! without touching the store.

use super::events::{ItemEvent, ItemResolution, StepEvent};
use super::states::{ItemStatus, StepStatus};
use crate::error::StateTransitionError;

/// Determine the step state reached from `current` on `event`.
pub fn determine_step_target(
    current: StepStatus,
    event: StepEvent,
) -> Result<StepStatus, StateTransitionError> {
    use StepStatus::*;

    let target = match (current, event) {
        // Running -> Running covers redelivered dispatch and re-polling
        (Pending | Running | Interrupted, StepEvent::Start) => Running,

        (Running, StepEvent::Settle(status @ (Running | Succeeded | Failed | PartialSuccess))) => {
            status
        }

        (Running, StepEvent::Interrupt) => Interrupted,

        (from, StepEvent::Retry | StepEvent::Reset) if from != Running => Pending,

        (from, event) => return Err(StateTransitionError::new(from, event)),
    };

    Ok(target)
}

/// Determine the item sub-state reached from `current` on `event`.
pub fn determine_item_target(
    current: ItemStatus,
    event: ItemEvent,
) -> Result<ItemStatus, StateTransitionError> {
    use ItemStatus::*;

    let target = match (current, event) {
        (Pending, ItemEvent::Dispatch) => Running,

        (Running, ItemEvent::Resolve(ItemResolution::Completed)) => Succeeded,
        (Running, ItemEvent::Resolve(ItemResolution::Queued)) => Running,
        (Running, ItemEvent::Resolve(ItemResolution::Failed)) => Failed,

        (Pending | Running, ItemEvent::Interrupt) => Interrupted,

        (Interrupted | Running, ItemEvent::Resume) => Pending,

        (_, ItemEvent::Reset) => Pending,

        (from, event) => return Err(StateTransitionError::new(from, event)),
    };

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_start_is_reentrant() {
        assert_eq!(
            determine_step_target(StepStatus::Running, StepEvent::Start).unwrap(),
            StepStatus::Running
        );
        assert_eq!(
            determine_step_target(StepStatus::Interrupted, StepEvent::Start).unwrap(),
            StepStatus::Running
        );
        assert!(determine_step_target(StepStatus::Succeeded, StepEvent::Start).is_err());
        assert!(determine_step_target(StepStatus::Failed, StepEvent::Start).is_err());
    }

    #[test]
    fn test_step_cannot_settle_into_interrupted() {
        assert!(determine_step_target(
            StepStatus::Running,
            StepEvent::Settle(StepStatus::Interrupted)
        )
        .is_err());
        assert!(determine_step_target(
            StepStatus::Interrupted,
            StepEvent::Settle(StepStatus::Succeeded)
        )
        .is_err());
    }

    #[test]
    fn test_interrupt_requires_running() {
        assert_eq!(
            determine_step_target(StepStatus::Running, StepEvent::Interrupt).unwrap(),
            StepStatus::Interrupted
        );
        assert!(determine_step_target(StepStatus::Pending, StepEvent::Interrupt).is_err());
    }

    #[test]
    fn test_retry_and_reset_reject_running() {
        for event in [StepEvent::Retry, StepEvent::Reset] {
            assert!(determine_step_target(StepStatus::Running, event).is_err());
            assert_eq!(
                determine_step_target(StepStatus::PartialSuccess, event).unwrap(),
                StepStatus::Pending
            );
        }
    }

    #[test]
    fn test_item_lifecycle() {
        let running = determine_item_target(ItemStatus::Pending, ItemEvent::Dispatch).unwrap();
        assert_eq!(running, ItemStatus::Running);
        assert_eq!(
            determine_item_target(running, ItemEvent::Resolve(ItemResolution::Queued)).unwrap(),
            ItemStatus::Running
        );
        assert_eq!(
            determine_item_target(running, ItemEvent::Resolve(ItemResolution::Completed))
                .unwrap(),
            ItemStatus::Succeeded
        );
        assert!(determine_item_target(ItemStatus::Succeeded, ItemEvent::Dispatch).is_err());
        assert_eq!(
            determine_item_target(ItemStatus::Interrupted, ItemEvent::Resume).unwrap(),
            ItemStatus::Pending
        );
        assert_eq!(
            determine_item_target(ItemStatus::Succeeded, ItemEvent::Reset).unwrap(),
            ItemStatus::Pending
        );
    }
}
