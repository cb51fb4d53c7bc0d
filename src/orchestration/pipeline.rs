//! # Pipeline Orchestrator
//!
//! Public entry points for the API layer and the message handler for workers.
//!
//! ## Advancement
//!
//! The orchestrator never runs the next stage inline. When a step settles as Succeeded
//! on an Auto task it emits `AdvancePipeline(task_id)`; whoever consumes that message
//! dispatches the first stage that has not succeeded. PartialSuccess, Failed and
//! Interrupted halt the chain until an operator retries or resumes.
//!
//! The Succeeded step row doubles as the outbox record: [`recover_stalled_tasks`]
//! re-derives every advancement that should have happened from persisted state and
//! emits it again. Delivery is at least once; duplicates are absorbed because starting
//! a step is a conditional write.
//!
//! [`recover_stalled_tasks`]: PipelineOrchestrator::recover_stalled_tasks

use super::interrupt::{InterruptController, InterruptOutcome};
use super::stages::{StageKind, StagePlan};
use super::step_executor::{StepExecutionResult, StepExecutor};
use crate::config::{ExecutionConfig, PipelineConfig};
use crate::constants::stages;
use crate::database::TaskStore;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::{log_item_operation, log_step_operation};
use crate::messaging::{DispatchTransport, PipelineMessage};
use crate::models::{ItemFeature, NewTask, Step, Task, WorkItem};
use crate::providers::ProviderRegistry;
use crate::slot_broker::SlotBroker;
use crate::state_machine::{
    determine_item_target, determine_step_target, ItemEvent, ItemStatus, StepEvent, StepStatus,
    TaskStatus,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Everything needed to render a task's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOverview {
    pub task: Task,
    pub steps: Vec<Step>,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub tasks_scanned: usize,
    /// `AdvancePipeline` messages re-emitted
    pub advanced: usize,
    /// `ExecuteStep` messages re-emitted for stale Running steps
    pub redispatched: usize,
}

pub struct PipelineOrchestrator {
    store: Arc<dyn TaskStore>,
    registry: Arc<ProviderRegistry>,
    broker: Arc<SlotBroker>,
    executor: StepExecutor,
    interrupts: Arc<InterruptController>,
    transport: Arc<dyn DispatchTransport>,
    plan: Arc<StagePlan>,
    config: ExecutionConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<SlotBroker>,
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn DispatchTransport>,
        config: &PipelineConfig,
    ) -> PipelineResult<Self> {
        let plan = Arc::new(StagePlan::new(
            &config.pipeline,
            config.execution.step_max_retries,
        )?);
        let interrupts = Arc::new(InterruptController::new(
            store.clone(),
            registry.clone(),
            plan.clone(),
        ));
        let executor = StepExecutor::new(
            store.clone(),
            broker.clone(),
            registry.clone(),
            interrupts.clone(),
            plan.clone(),
            config.execution.clone(),
        );

        info!(
            stages = plan.stages().len(),
            providers = registry.stats().total_providers,
            "🎬 Pipeline orchestrator initialized"
        );

        Ok(Self {
            store,
            registry,
            broker,
            executor,
            interrupts,
            transport,
            plan,
            config: config.execution.clone(),
        })
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn slot_broker(&self) -> &SlotBroker {
        &self.broker
    }

    /// Validate and persist a new task. Imported scenes become work items right away and
    /// the storyboard step is marked done. Auto tasks start advancing immediately.
    #[instrument(skip(self, request), fields(mode = %request.mode))]
    pub async fn create_task(&self, request: NewTask) -> PipelineResult<Task> {
        self.registry.validate_selection(&request.provider_map)?;
        if !(request.config.is_null() || request.config.is_object()) {
            return Err(PipelineError::validation("task config must be a JSON object"));
        }
        if matches!(&request.scenes, Some(scenes) if scenes.is_empty()) {
            return Err(PipelineError::validation(
                "imported scene list must not be empty",
            ));
        }

        let task = Task::new(&request);
        self.store.insert_task(&task).await?;
        let steps = self
            .store
            .ensure_steps(task.id, &self.plan.templates())
            .await?;

        if let Some(scenes) = &request.scenes {
            let items = self.store.insert_work_items(task.id, scenes).await?;
            self.store
                .set_task_units(task.id, items.len() as i32, 0)
                .await?;
            if let Some(storyboard) = steps.iter().find(|s| s.name == stages::STORYBOARD) {
                let mut storyboard = storyboard.clone();
                let now = Utc::now();
                storyboard.status = StepStatus::Succeeded;
                storyboard.progress = 100;
                storyboard.result = Some(json!({"scenes": items.len(), "imported": true}));
                storyboard.started_at = Some(now);
                storyboard.finished_at = Some(now);
                self.store
                    .update_step_if(&storyboard, StepStatus::Pending)
                    .await?;
            }
        }

        info!(
            task_id = %task.id,
            imported_scenes = request.scenes.as_ref().map(Vec::len).unwrap_or(0),
            "🆕 Task created"
        );

        if task.is_auto() {
            // A lost message is picked up by recover_stalled_tasks
            if let Err(e) = self.transport.dispatch(PipelineMessage::advance(task.id)).await {
                warn!(task_id = %task.id, error = %e, "Failed to emit initial advance");
            }
        }

        self.require_task(task.id).await
    }

    /// Dispatch a Pending or Interrupted step. The previous stage must have succeeded.
    #[instrument(skip(self))]
    pub async fn trigger_step(&self, task_id: Uuid, stage: &str) -> PipelineResult<Step> {
        let definition = self.plan.stage(stage)?;
        self.require_task(task_id).await?;
        let steps = self
            .store
            .ensure_steps(task_id, &self.plan.templates())
            .await?;
        let step = find_step(&steps, definition.name)?;
        self.check_predecessor(&steps, definition.name)?;

        if !matches!(step.status, StepStatus::Pending | StepStatus::Interrupted) {
            return Err(PipelineError::InvalidStepState {
                step_id: step.id,
                current: step.status.to_string(),
                expected: StepStatus::Pending.to_string(),
            });
        }

        self.transport
            .dispatch(PipelineMessage::execute_step(task_id, definition.name))
            .await?;
        log_step_operation(
            "trigger",
            Some(&task_id.to_string()),
            Some(&step.id.to_string()),
            Some(&step.name),
            &step.status.to_string(),
            None,
        );
        Ok(step)
    }

    /// Reset a settled step to Pending, count the retry and dispatch it. Failed items
    /// under the item retry limit (all of them with `force`) are re-opened; succeeded
    /// items are never touched.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, step_id: Uuid, force: bool) -> PipelineResult<Step> {
        let mut step = self.require_step(step_id).await?;
        if step.status == StepStatus::Running {
            return Err(not_running(&step));
        }
        if step.retries_exhausted() && !force {
            return Err(PipelineError::RetryLimitExceeded {
                target: format!("step {}", step.name),
                retry_count: step.retry_count,
                max_retries: step.max_retries,
            });
        }
        let steps = self.store.list_steps(step.task_id).await?;
        self.check_predecessor(&steps, &step.name)?;

        let previous = step.status;
        let target = determine_step_target(previous, StepEvent::Retry)?;
        step.clear_execution();
        step.status = target;
        step.retry_count += 1;
        if !self.store.update_step_if(&step, previous).await? {
            let current = self.require_step(step_id).await?;
            return Err(not_running(&current));
        }

        let reopened = self.reopen_failed_items(&step, force).await?;
        self.executor.finalizer().reconcile(step.task_id).await?;
        self.transport
            .dispatch(PipelineMessage::execute_step(step.task_id, step.name.clone()))
            .await?;

        log_step_operation(
            "retry",
            Some(&step.task_id.to_string()),
            Some(&step_id.to_string()),
            Some(&step.name),
            "pending",
            Some(&format!("retry {} reopened {reopened} items", step.retry_count)),
        );
        Ok(step)
    }

    /// Put a non-running step back to Pending without counting a retry or dispatching
    #[instrument(skip(self))]
    pub async fn reset_step(&self, step_id: Uuid) -> PipelineResult<Step> {
        let mut step = self.require_step(step_id).await?;
        let previous = step.status;
        let target =
            determine_step_target(previous, StepEvent::Reset).map_err(|_| not_running(&step))?;
        step.clear_execution();
        step.status = target;
        if !self.store.update_step_if(&step, previous).await? {
            let current = self.require_step(step_id).await?;
            return Err(not_running(&current));
        }
        self.executor.finalizer().reconcile(step.task_id).await?;

        log_step_operation(
            "reset",
            Some(&step.task_id.to_string()),
            Some(&step_id.to_string()),
            Some(&step.name),
            "pending",
            None,
        );
        Ok(step)
    }

    pub async fn interrupt_step(&self, step_id: Uuid) -> PipelineResult<InterruptOutcome> {
        let outcome = self.interrupts.interrupt(step_id).await?;
        self.executor
            .finalizer()
            .reconcile(outcome.step.task_id)
            .await?;
        Ok(outcome)
    }

    /// Re-run one item for one feature. Dependent downstream sub-states are reset too,
    /// along with every later task-level step. The run is scoped: it never advances the
    /// pipeline.
    #[instrument(skip(self))]
    pub async fn retry_work_item(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        force: bool,
    ) -> PipelineResult<WorkItem> {
        let item = self.require_item(item_id).await?;
        let definition = self.plan.stage_for_item(feature).ok_or_else(|| {
            PipelineError::validation(format!("no stage in this pipeline produces {feature}"))
        })?;

        let mut state = item.state(feature);
        if state.status == ItemStatus::Running {
            return Err(PipelineError::validation(format!(
                "scene {} {feature} is still running",
                item.seq
            )));
        }
        if state.retry_count >= self.config.max_item_retries && !force {
            return Err(PipelineError::RetryLimitExceeded {
                target: format!("scene {} {feature}", item.seq),
                retry_count: state.retry_count,
                max_retries: self.config.max_item_retries,
            });
        }

        let steps = self
            .store
            .ensure_steps(item.task_id, &self.plan.templates())
            .await?;
        let step = find_step(&steps, definition.name)?;
        if step.status == StepStatus::Running {
            return Err(not_running(&step));
        }

        state.status = determine_item_target(state.status, ItemEvent::Reset)?;
        state.reset();
        state.retry_count += 1;
        self.store.update_item_state(item.id, feature, &state).await?;
        log_item_operation(
            "retry",
            Some(&item.task_id.to_string()),
            Some(item.seq),
            feature.as_str(),
            "pending",
            Some(&format!("retry {}", state.retry_count)),
        );

        for downstream in feature.downstream() {
            let mut dependent = item.state(*downstream);
            if dependent.status != ItemStatus::Pending {
                dependent.status = determine_item_target(dependent.status, ItemEvent::Reset)?;
                dependent.reset();
                self.store
                    .update_item_state(item.id, *downstream, &dependent)
                    .await?;
            }
            if let Some(dependent_stage) = self.plan.stage_for_item(*downstream) {
                let dependent_step = find_step(&steps, dependent_stage.name)?;
                self.reopen_step(dependent_step).await?;
            }
        }

        // Task-level outputs were built from the old scene media
        let position = self.plan.position(definition.name).unwrap_or_default();
        for later in self.plan.stages().iter().skip(position + 1) {
            if later.kind == StageKind::TaskLevel {
                self.reopen_step(find_step(&steps, later.name)?).await?;
            }
        }

        self.reopen_step(step).await?;
        self.executor.finalizer().reconcile(item.task_id).await?;
        self.transport
            .dispatch(PipelineMessage::execute_item(
                item.task_id,
                definition.name,
                item.id,
            ))
            .await?;

        self.require_item(item_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> PipelineResult<Option<Task>> {
        self.store.get_task(task_id).await
    }

    pub async fn get_step(&self, step_id: Uuid) -> PipelineResult<Option<Step>> {
        self.store.get_step(step_id).await
    }

    pub async fn list_steps(&self, task_id: Uuid) -> PipelineResult<Vec<Step>> {
        self.store.list_steps(task_id).await
    }

    pub async fn get_work_item(&self, item_id: Uuid) -> PipelineResult<Option<WorkItem>> {
        self.store.get_work_item(item_id).await
    }

    pub async fn list_work_items(&self, task_id: Uuid) -> PipelineResult<Vec<WorkItem>> {
        self.store.list_work_items(task_id).await
    }

    pub async fn task_overview(&self, task_id: Uuid) -> PipelineResult<TaskOverview> {
        let task = self.require_task(task_id).await?;
        Ok(TaskOverview {
            steps: self.store.list_steps(task_id).await?,
            items: self.store.list_work_items(task_id).await?,
            task,
        })
    }

    /// Worker entry point for one delivered message
    #[instrument(skip(self), fields(message = %message))]
    pub async fn handle_message(&self, message: &PipelineMessage) -> PipelineResult<()> {
        match message {
            PipelineMessage::ExecuteStep {
                task_id,
                stage,
                item_id,
            } => {
                let result = self.executor.execute(*task_id, stage, *item_id).await?;
                if item_id.is_none() {
                    self.after_step(*task_id, &result).await?;
                }
                Ok(())
            }
            PipelineMessage::AdvancePipeline { task_id } => {
                self.advance(*task_id).await.map(|_| ())
            }
        }
    }

    async fn after_step(&self, task_id: Uuid, result: &StepExecutionResult) -> PipelineResult<()> {
        if result.step.status != StepStatus::Succeeded || self.plan.is_last(&result.step.name) {
            return Ok(());
        }
        match self.store.get_task(task_id).await? {
            Some(task) if task.is_auto() => {
                self.transport
                    .dispatch(PipelineMessage::advance(task_id))
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Dispatch the first stage of an Auto task that has not succeeded, if it is
    /// Pending. Returns the dispatched stage.
    #[instrument(skip(self))]
    pub async fn advance(&self, task_id: Uuid) -> PipelineResult<Option<String>> {
        let Some(task) = self.store.get_task(task_id).await? else {
            debug!("Task is gone, nothing to advance");
            return Ok(None);
        };
        if !task.is_auto() {
            debug!("Manual task, not advancing");
            return Ok(None);
        }

        let steps = self
            .store
            .ensure_steps(task_id, &self.plan.templates())
            .await?;
        for definition in self.plan.stages() {
            let step = find_step(&steps, definition.name)?;
            match step.status {
                StepStatus::Succeeded => continue,
                StepStatus::Pending => {
                    self.transport
                        .dispatch(PipelineMessage::execute_step(task_id, definition.name))
                        .await?;
                    info!(stage = %definition.name, "⏭️ Pipeline advanced");
                    return Ok(Some(definition.name.to_string()));
                }
                StepStatus::Running => {
                    debug!(stage = %definition.name, "Stage already running");
                    return Ok(None);
                }
                halted => {
                    info!(
                        stage = %definition.name,
                        status = %halted,
                        "Pipeline halted, waiting for an operator"
                    );
                    return Ok(None);
                }
            }
        }

        self.executor.finalizer().reconcile(task_id).await?;
        Ok(None)
    }

    /// Re-emit advancement that persisted state says should have happened, and
    /// re-dispatch Running steps nobody has touched within the stale window
    #[instrument(skip(self))]
    pub async fn recover_stalled_tasks(&self) -> PipelineResult<RecoveryReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_running_after())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for status in [TaskStatus::Pending, TaskStatus::Running] {
            for task in self.store.list_tasks_by_status(status).await? {
                report.tasks_scanned += 1;
                let steps: Vec<Step> = self
                    .store
                    .list_steps(task.id)
                    .await?
                    .into_iter()
                    .filter(|s| self.plan.position(&s.name).is_some())
                    .collect();

                for step in steps.iter().filter(|s| s.status == StepStatus::Running) {
                    if now - step.updated_at > stale_after {
                        self.transport
                            .dispatch(PipelineMessage::execute_step(task.id, step.name.clone()))
                            .await?;
                        report.redispatched += 1;
                    }
                }

                if task.is_auto() && self.next_stage_is_pending(&steps) {
                    self.transport
                        .dispatch(PipelineMessage::advance(task.id))
                        .await?;
                    report.advanced += 1;
                }
            }
        }

        if report.advanced + report.redispatched > 0 {
            info!(
                advanced = report.advanced,
                redispatched = report.redispatched,
                "🔁 Stalled tasks recovered"
            );
        }
        Ok(report)
    }

    fn next_stage_is_pending(&self, steps: &[Step]) -> bool {
        self.plan
            .stages()
            .iter()
            .filter_map(|d| steps.iter().find(|s| s.name == d.name))
            .find(|s| s.status != StepStatus::Succeeded)
            .map_or(false, |s| s.status == StepStatus::Pending)
    }

    fn check_predecessor(&self, steps: &[Step], stage: &str) -> PipelineResult<()> {
        let Some(previous) = self.plan.previous(stage) else {
            return Ok(());
        };
        let prev = find_step(steps, previous.name)?;
        if prev.status.satisfies_successor() {
            Ok(())
        } else {
            Err(PipelineError::InvalidStepState {
                step_id: prev.id,
                current: prev.status.to_string(),
                expected: StepStatus::Succeeded.to_string(),
            })
        }
    }

    async fn reopen_failed_items(&self, step: &Step, force: bool) -> PipelineResult<usize> {
        let Ok(definition) = self.plan.stage(&step.name) else {
            return Ok(0);
        };
        let StageKind::PerItem(feature) = definition.kind else {
            return Ok(0);
        };

        let mut reopened = 0;
        for item in self.store.list_work_items(step.task_id).await? {
            let mut state = item.state(feature);
            let eligible = state.status == ItemStatus::Failed
                && (force || state.retry_count < self.config.max_item_retries);
            if eligible {
                state.status = determine_item_target(state.status, ItemEvent::Reset)?;
                state.reset();
                self.store.update_item_state(item.id, feature, &state).await?;
                reopened += 1;
            }
        }
        Ok(reopened)
    }

    /// Move a settled step back to Pending so it reflects reset items
    async fn reopen_step(&self, mut step: Step) -> PipelineResult<()> {
        if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
            return Ok(());
        }
        let previous = step.status;
        step.status = determine_step_target(previous, StepEvent::Reset)?;
        step.error_msg = None;
        step.finished_at = None;
        step.external_job_id = None;
        step.result = None;
        if matches!(self.plan.stage(&step.name), Ok(d) if d.kind == StageKind::TaskLevel) {
            step.progress = 0;
        }
        self.store.update_step_if(&step, previous).await?;
        Ok(())
    }

    async fn require_task(&self, task_id: Uuid) -> PipelineResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", task_id))
    }

    async fn require_step(&self, step_id: Uuid) -> PipelineResult<Step> {
        self.store
            .get_step(step_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("step", step_id))
    }

    async fn require_item(&self, item_id: Uuid) -> PipelineResult<WorkItem> {
        self.store
            .get_work_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("work item", item_id))
    }
}

fn find_step(steps: &[Step], name: &str) -> PipelineResult<Step> {
    steps
        .iter()
        .find(|s| s.name == name)
        .cloned()
        .ok_or_else(|| PipelineError::not_found("step", name))
}

fn not_running(step: &Step) -> PipelineError {
    PipelineError::InvalidStepState {
        step_id: step.id,
        current: step.status.to_string(),
        expected: "not running".to_string(),
    }
}
