//! # Persistence Adapter
//!
//! Storage seam for the pipeline core.
//!
//! ## Overview
//!
//! Two traits split the five persisted entities along their access patterns:
//!
//! - [`TaskStore`] - tasks, steps and work items, written by the orchestrator and
//!   step executor
//! - [`SlotStore`] - slot limits and slot leases, written by the slot broker
//!
//! ## Implementations
//!
//! - [`PgStore`] - PostgreSQL via SQLx; admission counting runs inside a single
//!   transaction holding an advisory lock on the (service, feature) scope plus row
//!   locks on the live slots
//! - [`MemoryStore`] - a single `parking_lot::Mutex` over in-process maps; atomic by
//!   construction, used by tests, benchmarks and single-process embedding
//!
//! Every write that could race with an operator action is conditional:
//! [`TaskStore::update_step_if`] and [`TaskStore::update_item_state_if`] only apply
//! when the stored status still matches what the caller read.

pub mod connection;
pub mod memory;
pub mod postgres;

pub use connection::DatabaseConnection;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::PipelineResult;
use crate::models::{
    ItemFeature, SceneContent, Slot, SlotLimit, SlotRequest, Step, StepTemplate, SubState, Task,
    WorkItem,
};
use crate::state_machine::{ItemStatus, SlotStatus, StepStatus, TaskStatus};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> PipelineResult<()>;

    /// Soft-deleted tasks are not returned
    async fn get_task(&self, task_id: Uuid) -> PipelineResult<Option<Task>>;

    async fn list_tasks_by_status(&self, status: TaskStatus) -> PipelineResult<Vec<Task>>;

    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_msg: Option<String>,
    ) -> PipelineResult<()>;

    /// Explicit counter reset, used when the scene set is (re)established
    async fn set_task_units(
        &self,
        task_id: Uuid,
        total_units: i32,
        completed_units: i32,
    ) -> PipelineResult<()>;

    /// Raise `completed_units` to `completed`, capped at `total_units`; never lowers it
    async fn raise_completed_units(&self, task_id: Uuid, completed: i32) -> PipelineResult<()>;

    async fn soft_delete_task(&self, task_id: Uuid) -> PipelineResult<bool>;

    /// Create missing steps and re-sync `seq`/`max_retries` on existing ones.
    /// Returns every step of the task ordered by `seq`.
    async fn ensure_steps(
        &self,
        task_id: Uuid,
        templates: &[StepTemplate],
    ) -> PipelineResult<Vec<Step>>;

    async fn get_step(&self, step_id: Uuid) -> PipelineResult<Option<Step>>;

    /// Ordered by `seq`
    async fn list_steps(&self, task_id: Uuid) -> PipelineResult<Vec<Step>>;

    /// Persist every mutable column of `step` if the stored status is still
    /// `expected`. Returns whether the write applied.
    async fn update_step_if(&self, step: &Step, expected: StepStatus) -> PipelineResult<bool>;

    /// Bump `updated_at` while the step is still `expected`
    async fn touch_step(&self, step_id: Uuid, expected: StepStatus) -> PipelineResult<bool>;

    /// Append items with consecutive `seq` starting after the current maximum
    async fn insert_work_items(
        &self,
        task_id: Uuid,
        scenes: &[SceneContent],
    ) -> PipelineResult<Vec<WorkItem>>;

    /// Ordered by `seq`
    async fn list_work_items(&self, task_id: Uuid) -> PipelineResult<Vec<WorkItem>>;

    async fn get_work_item(&self, item_id: Uuid) -> PipelineResult<Option<WorkItem>>;

    async fn update_item_state(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        state: &SubState,
    ) -> PipelineResult<()>;

    /// Write one sub-state if its stored status is still `expected`. A feature with no
    /// stored sub-state counts as Pending.
    async fn update_item_state_if(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        state: &SubState,
        expected: ItemStatus,
    ) -> PipelineResult<bool>;
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Enabled limit with exactly this scope; `feature = None` is the service-wide row
    async fn get_slot_limit(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<Option<SlotLimit>>;

    async fn upsert_slot_limit(&self, limit: &SlotLimit) -> PipelineResult<()>;

    /// Atomically count live slots in the request scope and insert a new active
    /// slot if the count is below `max_slots`. `None` means the scope is full.
    async fn try_acquire_slot(&self, request: &SlotRequest) -> PipelineResult<Option<Slot>>;

    async fn get_slot(&self, slot_id: Uuid) -> PipelineResult<Option<Slot>>;

    /// Move an active slot to `status`, stamping `released_at` and merging
    /// `metadata`. `None` when the slot is missing or already released.
    async fn release_slot(
        &self,
        slot_id: Uuid,
        status: SlotStatus,
        metadata: Option<&serde_json::Value>,
    ) -> PipelineResult<Option<Slot>>;

    /// Merge into an active slot's metadata; false when the slot is not active
    async fn merge_slot_metadata(
        &self,
        slot_id: Uuid,
        metadata: &serde_json::Value,
    ) -> PipelineResult<bool>;

    /// Mark up to `batch_size` active slots past `expires_at` as expired.
    /// `scope` restricts the sweep to one (service, feature).
    async fn expire_slots(
        &self,
        scope: Option<(&str, Option<&str>)>,
        batch_size: i64,
    ) -> PipelineResult<u64>;

    /// Live (active and unexpired) slots in a scope
    async fn count_live_slots(&self, service: &str, feature: Option<&str>)
        -> PipelineResult<i64>;
}

/// Shallow JSON object merge; non-object inputs replace the target
pub(crate) fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(existing), Some(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ if !patch.is_null() => *target = patch.clone(),
        _ => {}
    }
}
