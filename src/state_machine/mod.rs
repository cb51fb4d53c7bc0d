// State machine module for the pipeline core
//
// Status enums for tasks, steps, work item sub-states and slots, the transition
// tables that guard every write, and the aggregation rule that derives a step's
// status from its items.

pub mod aggregation;
pub mod events;
pub mod states;
pub mod transitions;

pub use aggregation::{aggregate_step_status, StepCounts};
pub use events::{ItemEvent, ItemResolution, StepEvent};
pub use states::{ItemStatus, SlotStatus, StepStatus, TaskMode, TaskStatus};
pub use transitions::{determine_item_target, determine_step_target};
