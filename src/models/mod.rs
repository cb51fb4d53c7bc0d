pub mod feature;
pub mod slot;
pub mod step;
pub mod task;
pub mod work_item;

// Re-export core models for easy access
pub use feature::{Feature, ItemFeature, ProviderSelection};
pub use slot::{normalize_key, Slot, SlotLimit, SlotRequest, SlotToken};
pub use step::{Step, StepTemplate};
pub use task::{NewTask, Task};
pub use work_item::{SceneContent, SubState, WorkItem};
