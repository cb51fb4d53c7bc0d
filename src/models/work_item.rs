//! # Work Item Model
//!
//! One scene of a task. Each item tracks an independent sub-state per
//! [`ItemFeature`]; the step executor only touches the sub-state of the feature its
//! step produces. Items are never deleted, only reset.

use super::feature::ItemFeature;
use crate::state_machine::ItemStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Scene content established by the storyboard stage or an external import
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneContent {
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(default)]
    pub video_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubState {
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default)]
    pub external_job_id: Option<String>,
    #[serde(default)]
    pub resource_ref: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubState {
    /// Back to pending with output cleared; the retry counter survives
    pub fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.external_job_id = None;
        self.resource_ref = None;
        self.error = None;
        self.started_at = None;
        self.updated_at = Some(Utc::now());
    }

    pub fn merge_metadata(&mut self, meta: &Map<String, Value>) {
        for (key, value) in meta {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// A queued remote job that has to be polled rather than re-created
    pub fn awaiting_remote(&self) -> bool {
        self.status == ItemStatus::Running && self.external_job_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i32,
    pub content: SceneContent,
    #[serde(default)]
    pub states: BTreeMap<ItemFeature, SubState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(task_id: Uuid, seq: i32, content: SceneContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            seq,
            content,
            states: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sub-state for `feature`; an untouched feature reads as pending
    pub fn state(&self, feature: ItemFeature) -> SubState {
        self.states.get(&feature).cloned().unwrap_or_default()
    }

    pub fn status(&self, feature: ItemFeature) -> ItemStatus {
        self.states
            .get(&feature)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Output of a succeeded feature, if any
    pub fn resource(&self, feature: ItemFeature) -> Option<&str> {
        self.states
            .get(&feature)
            .filter(|s| s.status == ItemStatus::Succeeded)
            .and_then(|s| s.resource_ref.as_deref())
    }

    /// Stable correlation id for slot leases and provider requests
    pub fn resource_key(&self, feature: ItemFeature) -> String {
        format!("task:{}:item:{}:{}", self.task_id, self.seq, feature)
    }
}
