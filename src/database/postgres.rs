//! # PostgreSQL Store
//!
//! SQLx implementation of [`TaskStore`] and [`SlotStore`].
//!
//! ## Admission Atomicity
//!
//! `try_acquire_slot` runs one transaction that:
//!
//! 1. takes `pg_advisory_xact_lock` on a hash of the (service, feature) scope, which
//!    serializes acquirers even when there are no live rows to lock yet
//! 2. locks the live slot rows `FOR UPDATE` and counts them
//! 3. inserts the new active slot only if the count is below `max_slots`
//!
//! Both locks are released at commit or rollback.
//!
//! Queries are built at runtime (`sqlx::query_as::<_, Row>`) so the crate compiles
//! without a live database.

use super::{SlotStore, TaskStore};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    ItemFeature, ProviderSelection, SceneContent, Slot, SlotLimit, SlotRequest, Step,
    StepTemplate, SubState, Task, WorkItem,
};
use crate::state_machine::{ItemStatus, SlotStatus, StepStatus, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> PipelineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                PipelineError::DatabaseError(format!("Migration failed: {e}"))
            })
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> PipelineError {
    move |e| {
        error!("{}: {}", context, e);
        PipelineError::DatabaseError(format!("{context}: {e}"))
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(raw: &str) -> PipelineResult<T> {
    raw.parse()
        .map_err(|e: String| PipelineError::DatabaseError(format!("Invalid stored value: {e}")))
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    status: String,
    mode: String,
    total_units: i32,
    completed_units: i32,
    provider_map: Json<ProviderSelection>,
    config: Value,
    error_msg: Option<String>,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = PipelineError;

    fn try_from(row: TaskRow) -> PipelineResult<Self> {
        Ok(Task {
            id: row.id,
            status: parse_column(&row.status)?,
            mode: parse_column(&row.mode)?,
            total_units: row.total_units,
            completed_units: row.completed_units,
            provider_map: row.provider_map.0,
            config: row.config,
            error_msg: row.error_msg,
            deleted: row.deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StepRow {
    id: Uuid,
    task_id: Uuid,
    seq: i32,
    name: String,
    status: String,
    retry_count: i32,
    max_retries: i32,
    provider: Option<String>,
    external_job_id: Option<String>,
    progress: i32,
    result: Option<Value>,
    error_msg: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StepRow> for Step {
    type Error = PipelineError;

    fn try_from(row: StepRow) -> PipelineResult<Self> {
        Ok(Step {
            id: row.id,
            task_id: row.task_id,
            seq: row.seq,
            name: row.name,
            status: parse_column(&row.status)?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            provider: row.provider,
            external_job_id: row.external_job_id,
            progress: row.progress,
            result: row.result,
            error_msg: row.error_msg,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct WorkItemRow {
    id: Uuid,
    task_id: Uuid,
    seq: i32,
    content: Json<SceneContent>,
    states: Json<BTreeMap<ItemFeature, SubState>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            id: row.id,
            task_id: row.task_id,
            seq: row.seq,
            content: row.content.0,
            states: row.states.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct SlotLimitRow {
    service: String,
    feature: Option<String>,
    max_slots: i32,
    wait_interval_seconds: f64,
    wait_timeout_seconds: Option<f64>,
    slot_ttl_seconds: f64,
    enabled: bool,
}

impl From<SlotLimitRow> for SlotLimit {
    fn from(row: SlotLimitRow) -> Self {
        SlotLimit {
            service: row.service,
            feature: row.feature,
            max_slots: row.max_slots,
            wait_interval_seconds: row.wait_interval_seconds,
            wait_timeout_seconds: row.wait_timeout_seconds,
            slot_ttl_seconds: row.slot_ttl_seconds,
            enabled: row.enabled,
        }
    }
}

#[derive(FromRow)]
struct SlotRow {
    id: Uuid,
    service: String,
    feature: Option<String>,
    resource_id: Option<String>,
    status: String,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    metadata: Value,
}

impl TryFrom<SlotRow> for Slot {
    type Error = PipelineError;

    fn try_from(row: SlotRow) -> PipelineResult<Self> {
        Ok(Slot {
            id: row.id,
            service: row.service,
            feature: row.feature,
            resource_id: row.resource_id,
            status: parse_column(&row.status)?,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            released_at: row.released_at,
            metadata: row.metadata,
        })
    }
}

const TASK_COLUMNS: &str = "id, status, mode, total_units, completed_units, provider_map, \
     config, error_msg, deleted, created_at, updated_at";

const STEP_COLUMNS: &str = "id, task_id, seq, name, status, retry_count, max_retries, provider, \
     external_job_id, progress, result, error_msg, started_at, finished_at, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, task_id, seq, content, states, created_at, updated_at";

const SLOT_COLUMNS: &str =
    "id, service, feature, resource_id, status, acquired_at, expires_at, released_at, metadata";

#[async_trait]
impl TaskStore for PgStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn insert_task(&self, task: &Task) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_tasks
                (id, status, mode, total_units, completed_units, provider_map, config,
                 error_msg, deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id)
        .bind(task.status.to_string())
        .bind(task.mode.to_string())
        .bind(task.total_units)
        .bind(task.completed_units)
        .bind(Json(&task.provider_map))
        .bind(&task.config)
        .bind(&task.error_msg)
        .bind(task.deleted)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Task insert failed"))?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> PipelineResult<Option<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE id = $1 AND NOT deleted");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Task lookup failed"))?
            .map(Task::try_from)
            .transpose()
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> PipelineResult<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM pipeline_tasks \
             WHERE status = $1 AND NOT deleted ORDER BY created_at"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Task listing failed"))?
            .into_iter()
            .map(Task::try_from)
            .collect()
    }

    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_msg: Option<String>,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks SET status = $2, error_msg = $3, updated_at = now() WHERE id = $1",
        )
        .bind(task_id)
        .bind(status.to_string())
        .bind(error_msg)
        .execute(&self.pool)
        .await
        .map_err(db_error("Task status update failed"))?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn set_task_units(
        &self,
        task_id: Uuid,
        total_units: i32,
        completed_units: i32,
    ) -> PipelineResult<()> {
        let total = total_units.max(0);
        let result = sqlx::query(
            "UPDATE pipeline_tasks SET total_units = $2, completed_units = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(total)
        .bind(completed_units.clamp(0, total))
        .execute(&self.pool)
        .await
        .map_err(db_error("Task unit update failed"))?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn raise_completed_units(&self, task_id: Uuid, completed: i32) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_tasks
            SET completed_units = LEAST($2, total_units), updated_at = now()
            WHERE id = $1 AND LEAST($2, total_units) > completed_units
            "#,
        )
        .bind(task_id)
        .bind(completed)
        .execute(&self.pool)
        .await
        .map_err(db_error("Task progress update failed"))?;
        Ok(())
    }

    async fn soft_delete_task(&self, task_id: Uuid) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks SET deleted = TRUE, updated_at = now() WHERE id = $1 AND NOT deleted",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Task soft delete failed"))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, templates), fields(task_id = %task_id, templates = templates.len()))]
    async fn ensure_steps(
        &self,
        task_id: Uuid,
        templates: &[StepTemplate],
    ) -> PipelineResult<Vec<Step>> {
        let mut tx = self.pool.begin().await.map_err(db_error("Transaction begin failed"))?;

        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM pipeline_tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("Task lock failed"))?;
        if exists.is_none() {
            return Err(PipelineError::not_found("task", task_id));
        }

        for template in templates {
            sqlx::query(
                r#"
                INSERT INTO pipeline_steps (id, task_id, seq, name, status, max_retries)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                ON CONFLICT (task_id, name) DO UPDATE
                SET seq = EXCLUDED.seq, max_retries = EXCLUDED.max_retries, updated_at = now()
                WHERE pipeline_steps.seq <> EXCLUDED.seq
                   OR pipeline_steps.max_retries <> EXCLUDED.max_retries
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(task_id)
            .bind(template.seq)
            .bind(&template.name)
            .bind(template.max_retries)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Step ensure failed"))?;
        }

        tx.commit().await.map_err(db_error("Transaction commit failed"))?;
        debug!(task_id = %task_id, "Steps ensured");
        self.list_steps(task_id).await
    }

    async fn get_step(&self, step_id: Uuid) -> PipelineResult<Option<Step>> {
        let query = format!("SELECT {STEP_COLUMNS} FROM pipeline_steps WHERE id = $1");
        sqlx::query_as::<_, StepRow>(&query)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Step lookup failed"))?
            .map(Step::try_from)
            .transpose()
    }

    async fn list_steps(&self, task_id: Uuid) -> PipelineResult<Vec<Step>> {
        let query =
            format!("SELECT {STEP_COLUMNS} FROM pipeline_steps WHERE task_id = $1 ORDER BY seq");
        sqlx::query_as::<_, StepRow>(&query)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Step listing failed"))?
            .into_iter()
            .map(Step::try_from)
            .collect()
    }

    #[instrument(skip(self, step), fields(step_id = %step.id, expected = %expected, next = %step.status))]
    async fn update_step_if(&self, step: &Step, expected: StepStatus) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_steps
            SET seq = $3, status = $4, retry_count = $5, max_retries = $6, provider = $7,
                external_job_id = $8, progress = $9, result = $10, error_msg = $11,
                started_at = $12, finished_at = $13, updated_at = now()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(step.id)
        .bind(expected.to_string())
        .bind(step.seq)
        .bind(step.status.to_string())
        .bind(step.retry_count)
        .bind(step.max_retries)
        .bind(&step.provider)
        .bind(&step.external_job_id)
        .bind(step.progress)
        .bind(&step.result)
        .bind(&step.error_msg)
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Step update failed"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_step(step.id).await?.is_none() {
            return Err(PipelineError::not_found("step", step.id));
        }
        Ok(false)
    }

    async fn touch_step(&self, step_id: Uuid, expected: StepStatus) -> PipelineResult<bool> {
        let result =
            sqlx::query("UPDATE pipeline_steps SET updated_at = now() WHERE id = $1 AND status = $2")
                .bind(step_id)
                .bind(expected.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_error("Step heartbeat failed"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_work_items(
        &self,
        task_id: Uuid,
        scenes: &[SceneContent],
    ) -> PipelineResult<Vec<WorkItem>> {
        let mut tx = self.pool.begin().await.map_err(db_error("Transaction begin failed"))?;

        // Serializes concurrent appends for the same task
        sqlx::query("SELECT id FROM pipeline_tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("Task lock failed"))?
            .ok_or_else(|| PipelineError::not_found("task", task_id))?;

        let (max_seq,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(seq) FROM pipeline_work_items WHERE task_id = $1")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Work item sequence lookup failed"))?;
        let next_seq = max_seq.unwrap_or(0) + 1;

        let query = format!(
            "INSERT INTO pipeline_work_items (id, task_id, seq, content, states) \
             VALUES ($1, $2, $3, $4, '{{}}'::jsonb) RETURNING {ITEM_COLUMNS}"
        );
        let mut created = Vec::with_capacity(scenes.len());
        for (offset, scene) in scenes.iter().enumerate() {
            let row = sqlx::query_as::<_, WorkItemRow>(&query)
                .bind(Uuid::new_v4())
                .bind(task_id)
                .bind(next_seq + offset as i32)
                .bind(Json(scene))
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Work item insert failed"))?;
            created.push(WorkItem::from(row));
        }

        tx.commit().await.map_err(db_error("Transaction commit failed"))?;
        Ok(created)
    }

    async fn list_work_items(&self, task_id: Uuid) -> PipelineResult<Vec<WorkItem>> {
        let query = format!(
            "SELECT {ITEM_COLUMNS} FROM pipeline_work_items WHERE task_id = $1 ORDER BY seq"
        );
        Ok(sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Work item listing failed"))?
            .into_iter()
            .map(WorkItem::from)
            .collect())
    }

    async fn get_work_item(&self, item_id: Uuid) -> PipelineResult<Option<WorkItem>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM pipeline_work_items WHERE id = $1");
        Ok(sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Work item lookup failed"))?
            .map(WorkItem::from))
    }

    async fn update_item_state(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        state: &SubState,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_work_items
            SET states = jsonb_set(states, ARRAY[$2::text], $3::jsonb, true), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(feature.as_str())
        .bind(Json(state))
        .execute(&self.pool)
        .await
        .map_err(db_error("Work item state update failed"))?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("work item", item_id));
        }
        Ok(())
    }

    async fn update_item_state_if(
        &self,
        item_id: Uuid,
        feature: ItemFeature,
        state: &SubState,
        expected: ItemStatus,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_work_items
            SET states = jsonb_set(states, ARRAY[$2::text], $3::jsonb, true), updated_at = now()
            WHERE id = $1 AND COALESCE(states -> $2::text ->> 'status', 'pending') = $4
            "#,
        )
        .bind(item_id)
        .bind(feature.as_str())
        .bind(Json(state))
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error("Conditional work item update failed"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_work_item(item_id).await?.is_none() {
            return Err(PipelineError::not_found("work item", item_id));
        }
        Ok(false)
    }
}

#[async_trait]
impl SlotStore for PgStore {
    async fn get_slot_limit(
        &self,
        service: &str,
        feature: Option<&str>,
    ) -> PipelineResult<Option<SlotLimit>> {
        let row = sqlx::query_as::<_, SlotLimitRow>(
            r#"
            SELECT service, feature, max_slots, wait_interval_seconds, wait_timeout_seconds,
                   slot_ttl_seconds, enabled
            FROM slot_limits
            WHERE service = $1 AND feature IS NOT DISTINCT FROM $2::text AND enabled
            LIMIT 1
            "#,
        )
        .bind(service)
        .bind(feature)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Slot limit lookup failed"))?;
        Ok(row.map(SlotLimit::from))
    }

    async fn upsert_slot_limit(&self, limit: &SlotLimit) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO slot_limits
                (service, feature, max_slots, wait_interval_seconds, wait_timeout_seconds,
                 slot_ttl_seconds, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (service, (COALESCE(feature, ''))) DO UPDATE
            SET max_slots = EXCLUDED.max_slots,
                wait_interval_seconds = EXCLUDED.wait_interval_seconds,
                wait_timeout_seconds = EXCLUDED.wait_timeout_seconds,
                slot_ttl_seconds = EXCLUDED.slot_ttl_seconds,
                enabled = EXCLUDED.enabled,
                updated_at = now()
            "#,
        )
        .bind(&limit.service)
        .bind(&limit.feature)
        .bind(limit.max_slots)
        .bind(limit.wait_interval_seconds)
        .bind(limit.wait_timeout_seconds)
        .bind(limit.slot_ttl_seconds)
        .bind(limit.enabled)
        .execute(&self.pool)
        .await
        .map_err(db_error("Slot limit upsert failed"))?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(service = %request.service, feature = ?request.feature, max_slots = request.max_slots))]
    async fn try_acquire_slot(&self, request: &SlotRequest) -> PipelineResult<Option<Slot>> {
        let mut tx = self.pool.begin().await.map_err(db_error("Transaction begin failed"))?;

        let scope_key = format!(
            "slot:{}:{}",
            request.service,
            request.feature.as_deref().unwrap_or("*")
        );
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&scope_key)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Slot scope lock failed"))?;

        let live: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM slots
            WHERE service = $1
              AND feature IS NOT DISTINCT FROM $2::text
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > now())
            FOR UPDATE
            "#,
        )
        .bind(&request.service)
        .bind(&request.feature)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Slot count failed"))?;

        if live.len() as i64 >= i64::from(request.max_slots) {
            tx.rollback().await.map_err(db_error("Transaction rollback failed"))?;
            debug!(live = live.len(), "Slot scope is full");
            return Ok(None);
        }

        let query = format!(
            "INSERT INTO slots (id, service, feature, resource_id, status, acquired_at, expires_at, metadata) \
             VALUES ($1, $2, $3, $4, 'active', now(), now() + ($5 * interval '1 second'), \
                     COALESCE($6::jsonb, '{{}}'::jsonb)) \
             RETURNING {SLOT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SlotRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&request.service)
            .bind(&request.feature)
            .bind(&request.resource_id)
            .bind(request.ttl.as_secs_f64())
            .bind(&request.metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Slot insert failed"))?;

        tx.commit().await.map_err(db_error("Transaction commit failed"))?;
        Slot::try_from(row).map(Some)
    }

    async fn get_slot(&self, slot_id: Uuid) -> PipelineResult<Option<Slot>> {
        let query = format!("SELECT {SLOT_COLUMNS} FROM slots WHERE id = $1");
        sqlx::query_as::<_, SlotRow>(&query)
            .bind(slot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Slot lookup failed"))?
            .map(Slot::try_from)
            .transpose()
    }

    async fn release_slot(
        &self,
        slot_id: Uuid,
        status: SlotStatus,
        metadata: Option<&Value>,
    ) -> PipelineResult<Option<Slot>> {
        let query = format!(
            "UPDATE slots SET status = $2, released_at = now(), \
                 metadata = metadata || COALESCE($3::jsonb, '{{}}'::jsonb) \
             WHERE id = $1 AND status = 'active' \
             RETURNING {SLOT_COLUMNS}"
        );
        sqlx::query_as::<_, SlotRow>(&query)
            .bind(slot_id)
            .bind(status.to_string())
            .bind(metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Slot release failed"))?
            .map(Slot::try_from)
            .transpose()
    }

    async fn merge_slot_metadata(&self, slot_id: Uuid, metadata: &Value) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE slots SET metadata = metadata || $2::jsonb WHERE id = $1 AND status = 'active'",
        )
        .bind(slot_id)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(db_error("Slot metadata update failed"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_slots(
        &self,
        scope: Option<(&str, Option<&str>)>,
        batch_size: i64,
    ) -> PipelineResult<u64> {
        let (service, feature) = match scope {
            Some((service, feature)) => (Some(service), feature),
            None => (None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE slots SET status = 'expired', released_at = now()
            WHERE id IN (
                SELECT id FROM slots
                WHERE status = 'active'
                  AND expires_at IS NOT NULL
                  AND expires_at < now()
                  AND ($1::text IS NULL OR (service = $1 AND feature IS NOT DISTINCT FROM $2::text))
                ORDER BY acquired_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(service)
        .bind(feature)
        .bind(batch_size)
        .execute(&self.pool)
        .await
        .map_err(db_error("Slot expiry sweep failed"))?;
        Ok(result.rows_affected())
    }

    async fn count_live_slots(&self, service: &str, feature: Option<&str>) -> PipelineResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM slots
            WHERE service = $1
              AND feature IS NOT DISTINCT FROM $2::text
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(service)
        .bind(feature)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Slot count failed"))?;
        Ok(count)
    }
}
