//! In-process store backed by a single mutex.
//!
//! Each trait method takes the lock once, so the count-and-insert in
//! `try_acquire_slot` is atomic with respect to every other caller in the process.

use super::{merge_json, SlotStore, TaskStore};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    ItemFeature, SceneContent, Slot, SlotLimit, SlotRequest, Step, StepTemplate, SubState, Task,
    WorkItem,
};
use crate::state_machine::{ItemStatus, SlotStatus, StepStatus, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    steps: HashMap<Uuid, Step>,
    items: HashMap<Uuid, WorkItem>,
    limits: HashMap<(String, Option<String>), SlotLimit>,
    slots: HashMap<Uuid, Slot>,
    /// Slot ids in acquisition order, for deterministic purge batches
    slot_order: Vec<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift a slot's acquisition and expiry into the past, as if `by` had elapsed
    pub fn age_slot(&self, slot_id: Uuid, by: chrono::Duration) -> bool {
        let mut state = self.state.lock();
        match state.slots.get_mut(&slot_id) {
            Some(slot) => {
                slot.acquired_at -= by;
                slot.expires_at = slot.expires_at.map(|at| at - by);
                true
            }
            None => false,
        }
    }

    /// Shift a work item sub-state's `started_at` into the past
    pub fn age_item_state(&self, item_id: Uuid, feature: ItemFeature, by: chrono::Duration) {
        let mut state = self.state.lock();
        if let Some(sub) = state
            .items
            .get_mut(&item_id)
            .and_then(|item| item.states.get_mut(&feature))
        {
            sub.started_at = sub.started_at.map(|at| at - by);
        }
    }

    /// Shift a step's `updated_at` into the past
    pub fn age_step(&self, step_id: Uuid, by: chrono::Duration) {
        let mut state = self.state.lock();
        if let Some(step) = state.steps.get_mut(&step_id) {
            step.updated_at -= by;
        }
    }

    /// All slots ever created in a scope, oldest first
    pub fn slots_in_scope(&self, service: &str, feature: Option<&str>) -> Vec<Slot> {
        let state = self.state.lock();
        state
            .slot_order
            .iter()
            .filter_map(|id| state.slots.get(id))
            .filter(|s| s.service == service && s.feature.as_deref() == feature)
            .cloned()
            .collect()
    }
}

fn live_count(state: &MemoryState, service: &str, feature: Option<&str>) -> i64 {
    let now = Utc::now();
    state
        .slots
        .values()
        .filter(|s| s.service == service && s.feature.as_deref() == feature && s.is_live(now))
        .count() as i64
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if state.tasks.contains_key(&task.id) {
            return Err(PipelineError::DatabaseError(format!(
                "duplicate task id {}",
                task.id
            )));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> PipelineResult<Option<Task>> {
        let state = self.state.lock();
        Ok(state.tasks.get(&task_id).filter(|t| !t.deleted).cloned())
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> PipelineResult<Vec<Task>> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| !t.deleted && t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_msg: Option<String>,
    ) -> PipelineResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;
        task.status = status;
        task.error_msg = error_msg;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_units(
        &self,
        task_id: Uuid,
        total_units: i32,
        completed_units: i32,
    ) -> PipelineResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;
        task.total_units = total_units.max(0);
        task.completed_units = completed_units.clamp(0, task.total_units);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn raise_completed_units(&self, task_id: Uuid, completed: i32) -> PipelineResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;
        let capped = completed.min(task.total_units);
        if capped > task.completed_units {
            task.completed_units = capped;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete_task(&self, task_id: Uuid) -> PipelineResult<bool> {
        let mut state = self.state.lock();
        Ok(match state.tasks.get_mut(&task_id) {
            Some(task) if !task.deleted => {
                task.deleted = true;
                task.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn ensure_steps(
        &self,
        task_id: Uuid,
        templates: &[StepTemplate],
    ) -> PipelineResult<Vec<Step>> {
        let mut state = self.state.lock();
        if !state.tasks.contains_key(&task_id) {
            return Err(PipelineError::not_found("task", task_id));
        }

        let state = &mut *state;
        for template in templates {
            let existing = state
                .steps
                .values_mut()
                .find(|s| s.task_id == task_id && s.name == template.name);
            match existing {
                Some(step) => {
                    if step.seq != template.seq || step.max_retries != template.max_retries {
                        step.seq = template.seq;
                        step.max_retries = template.max_retries;
                        step.updated_at = Utc::now();
                    }
                }
                None => {
                    let step = Step::new(task_id, template);
                    state.steps.insert(step.id, step);
                }
            }
        }

        let mut steps: Vec<Step> = state
            .steps
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn get_step(&self, step_id: Uuid) -> PipelineResult<Option<Step>> {
        Ok(self.state.lock().steps.get(&step_id).cloned())
    }

    async fn list_steps(&self, task_id: Uuid) -> PipelineResult<Vec<Step>> {
        let state = self.state.lock();
        let mut steps: Vec<Step> = state
            .steps
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn update_step_if(&self, step: &Step, expected: StepStatus) -> PipelineResult<bool> {
        let mut state = self.state.lock();
        match state.steps.get_mut(&step.id) {
            Some(stored) if stored.status == expected => {
                *stored = step.clone();
                stored.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PipelineError::not_found("step", step.id)),
        }
    }

    async fn touch_step(&self, step_id: Uuid, expected: StepStatus) -> PipelineResult<bool> {
        let mut state = self.state.lock();
        match state.steps.get_mut(&step_id) {
            Some(stored) if stored.status == expected => {
                stored.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PipelineError::not_found("step", step_id)),
        }
    }

    async fn insert_work_items(
        &self,
        task_id: Uuid,
        scenes: &[SceneContent],
    ) -> PipelineResult<Vec<WorkItem>> {
        let mut state = self.state.lock();
        let next_seq = state
            .items
            .values()
            .filter(|i| i.task_id == task_id)
            .map(|i| i.seq)
            .max()
            .unwrap_or(0)
            + 1;

        let mut created = Vec::with_capacity(scenes.len());
        for (offset, scene) in scenes.iter().enumerate() {
            let item = WorkItem::new(task_id, next_seq + offset as i32, scene.clone());
            state.items.insert(item.id, item.clone());
            created.push(item);
        }
        Ok(created)
    }

    async fn list_work_items(&self, task_id: Uuid) -> PipelineResult<Vec<WorkItem>> {
        let state = self.state.lock();
        let mut items: Vec<WorkItem> = state
            .items
            .values()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.seq);
        Ok(items)
    }

    async fn get_work_item(&self, item_id: Uuid) -> PipelineResult<Option<WorkItem>> {
        Ok(self.state.lock().items.get(&item_id).cloned())
    }

    async fn update_item_state(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        sub_state: &SubState,
    ) -> PipelineResult<()> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| PipelineError::not_found("work item", item_id))?;
        item.states.insert(feature, sub_state.clone());
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn update_item_state_if(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        sub_state: &SubState,
        expected: ItemStatus,
    ) -> PipelineResult<bool> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| PipelineError::not_found("work item", item_id))?;
        if item.status(feature) != expected {
            return Ok(false);
        }
        item.states.insert(feature, sub_state.clone());
        item.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn get_slot_limit(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<Option<SlotLimit>> {
        let state = self.state.lock();
        Ok(state
            .limits
            .get(&(service.to_string(), feature.map(str::to_string)))
            .filter(|l| l.enabled)
            .cloned())
    }

    async fn upsert_slot_limit(&self, limit: &SlotLimit) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.limits.insert(
            (limit.service.clone(), limit.feature.clone()),
            limit.clone(),
        );
        Ok(())
    }

    async fn try_acquire_slot(&self, request: &SlotRequest) -> PipelineResult<Option<Slot>> {
        let mut state = self.state.lock();
        let live = live_count(&state, &request.service, request.feature.as_deref());
        if live >= i64::from(request.max_slots) {
            return Ok(None);
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|e| PipelineError::validation(format!("slot ttl out of range: {e}")))?;
        let slot = Slot {
            id: Uuid::new_v4(),
            service: request.service.clone(),
            feature: request.feature.clone(),
            resource_id: request.resource_id.clone(),
            status: SlotStatus::Active,
            acquired_at: now,
            expires_at: Some(now + ttl),
            released_at: None,
            metadata: request
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
        };
        state.slot_order.push(slot.id);
        state.slots.insert(slot.id, slot.clone());
        Ok(Some(slot))
    }

    async fn get_slot(&self, slot_id: Uuid) -> PipelineResult<Option<Slot>> {
        Ok(self.state.lock().slots.get(&slot_id).cloned())
    }

    async fn release_slot(
        &self,
        slot_id: Uuid,
        status: SlotStatus,
        metadata: Option<&serde_json::Value>,
    ) -> PipelineResult<Option<Slot>> {
        let mut state = self.state.lock();
        match state.slots.get_mut(&slot_id) {
            Some(slot) if slot.status.is_active() => {
                slot.status = status;
                slot.released_at = Some(Utc::now());
                if let Some(patch) = metadata {
                    merge_json(&mut slot.metadata, patch);
                }
                Ok(Some(slot.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn merge_slot_metadata(
        &self,
        slot_id: Uuid,
        metadata: &serde_json::Value,
    ) -> PipelineResult<bool> {
        let mut state = self.state.lock();
        match state.slots.get_mut(&slot_id) {
            Some(slot) if slot.status.is_active() => {
                merge_json(&mut slot.metadata, metadata);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_slots(
        &self,
        scope: Option<(&str, Option<&str>)>,
        batch_size: i64,
    ) -> PipelineResult<u64> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let limit = usize::try_from(batch_size.max(0)).unwrap_or(usize::MAX);

        let expired: Vec<Uuid> = state
            .slot_order
            .iter()
            .filter_map(|id| state.slots.get(id))
            .filter(|s| s.status.is_active())
            .filter(|s| s.expires_at.is_some_and(|at| at < now))
            .filter(|s| match scope {
                Some((service, feature)) => {
                    s.service == service && s.feature.as_deref() == feature
                }
                None => true,
            })
            .map(|s| s.id)
            .take(limit)
            .collect();

        for id in &expired {
            if let Some(slot) = state.slots.get_mut(id) {
                slot.status = SlotStatus::Expired;
                slot.released_at = Some(now);
            }
        }
        Ok(expired.len() as u64)
    }

    async fn count_live_slots(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<i64> {
        Ok(live_count(&self.state.lock(), service, feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use std::time::Duration;

    fn request(max_slots: i32) -> SlotRequest {
        SlotRequest {
            service: "svc".into(),
            feature: Some("image".into()),
            resource_id: None,
            max_slots,
            ttl: Duration::from_secs(60),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_acquire_respects_capacity() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_slot(&request(1)).await.unwrap().is_some());
        assert!(store.try_acquire_slot(&request(1)).await.unwrap().is_none());
        assert_eq!(store.count_live_slots("svc", Some("image")).await.unwrap(), 1);
        // Service-wide scope is counted separately
        assert_eq!(store.count_live_slots("svc", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aged_slot_expires() {
        let store = MemoryStore::new();
        let slot = store.try_acquire_slot(&request(1)).await.unwrap().unwrap();
        store.age_slot(slot.id, chrono::Duration::seconds(120));
        assert_eq!(store.count_live_slots("svc", Some("image")).await.unwrap(), 0);
        assert_eq!(store.expire_slots(None, 10).await.unwrap(), 1);
        let slot = store.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(slot.status, SlotStatus::Expired);
    }

    #[tokio::test]
    async fn test_update_step_if_is_conditional() {
        let store = MemoryStore::new();
        let task = Task::new(&NewTask::default());
        store.insert_task(&task).await.unwrap();
        let steps = store
            .ensure_steps(
                task.id,
                &[StepTemplate {
                    seq: 1,
                    name: "storyboard".into(),
                    max_retries: 3,
                }],
            )
            .await
            .unwrap();

        let mut step = steps[0].clone();
        step.status = StepStatus::Running;
        assert!(store.update_step_if(&step, StepStatus::Pending).await.unwrap());
        step.status = StepStatus::Succeeded;
        assert!(!store.update_step_if(&step, StepStatus::Pending).await.unwrap());
        let stored = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_touch_step_only_while_expected() {
        let store = MemoryStore::new();
        let task = Task::new(&NewTask::default());
        store.insert_task(&task).await.unwrap();
        let steps = store
            .ensure_steps(
                task.id,
                &[StepTemplate {
                    seq: 1,
                    name: "generate_images".into(),
                    max_retries: 3,
                }],
            )
            .await
            .unwrap();
        let step = &steps[0];
        store.age_step(step.id, chrono::Duration::minutes(5));
        let aged = store.get_step(step.id).await.unwrap().unwrap().updated_at;

        assert!(!store.touch_step(step.id, StepStatus::Running).await.unwrap());
        assert!(store.touch_step(step.id, StepStatus::Pending).await.unwrap());
        let touched = store.get_step(step.id).await.unwrap().unwrap().updated_at;
        assert!(touched > aged);
    }

    #[tokio::test]
    async fn test_item_claim_is_conditional() {
        let store = MemoryStore::new();
        let task = Task::new(&NewTask::default());
        store.insert_task(&task).await.unwrap();
        let items = store
            .insert_work_items(task.id, &[SceneContent::default()])
            .await
            .unwrap();
        let item = &items[0];

        let mut claimed = item.state(ItemFeature::Image);
        claimed.status = ItemStatus::Running;
        assert!(store
            .update_item_state_if(item.id, ItemFeature::Image, &claimed, ItemStatus::Pending)
            .await
            .unwrap());
        // A second claimer read the same Pending state and loses
        assert!(!store
            .update_item_state_if(item.id, ItemFeature::Image, &claimed, ItemStatus::Pending)
            .await
            .unwrap());

        let stored = store.get_work_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status(ItemFeature::Image), ItemStatus::Running);
        assert_eq!(stored.status(ItemFeature::Audio), ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_ensure_steps_is_idempotent() {
        let store = MemoryStore::new();
        let task = Task::new(&NewTask::default());
        store.insert_task(&task).await.unwrap();
        let templates = vec![StepTemplate {
            seq: 1,
            name: "storyboard".into(),
            max_retries: 3,
        }];
        let first = store.ensure_steps(task.id, &templates).await.unwrap();
        let resynced = vec![StepTemplate {
            max_retries: 5,
            ..templates[0].clone()
        }];
        let second = store.ensure_steps(task.id, &resynced).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].max_retries, 5);
    }
}
