//! # Pipeline Messages
//!
//! Dispatch intents emitted by the orchestrator and consumed by pipeline workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMessage {
    /// Run one stage of a task. With `item_id` set, only that work item is processed
    /// and the pipeline is not advanced afterwards.
    ExecuteStep {
        task_id: Uuid,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<Uuid>,
    },
    /// Dispatch the first stage of the task that has not succeeded yet
    AdvancePipeline { task_id: Uuid },
}

impl PipelineMessage {
    pub fn execute_step(task_id: Uuid, stage: impl Into<String>) -> Self {
        Self::ExecuteStep {
            task_id,
            stage: stage.into(),
            item_id: None,
        }
    }

    pub fn execute_item(task_id: Uuid, stage: impl Into<String>, item_id: Uuid) -> Self {
        Self::ExecuteStep {
            task_id,
            stage: stage.into(),
            item_id: Some(item_id),
        }
    }

    pub fn advance(task_id: Uuid) -> Self {
        Self::AdvancePipeline { task_id }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            Self::ExecuteStep { task_id, .. } | Self::AdvancePipeline { task_id } => *task_id,
        }
    }

    /// Convert to JSON for queue storage
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Create from JSON from queue
    pub fn from_json(json: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json)
    }
}

impl fmt::Display for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecuteStep {
                task_id,
                stage,
                item_id: Some(item_id),
            } => write!(f, "execute_step({task_id}, {stage}, item={item_id})"),
            Self::ExecuteStep { task_id, stage, .. } => {
                write!(f, "execute_step({task_id}, {stage})")
            }
            Self::AdvancePipeline { task_id } => write!(f, "advance_pipeline({task_id})"),
        }
    }
}

/// A message plus delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: PipelineMessage,
    pub correlation_id: Uuid,
    /// Starts at 1 and grows on every redelivery
    pub delivery_attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(message: PipelineMessage) -> Self {
        Self {
            message,
            correlation_id: Uuid::new_v4(),
            delivery_attempt: 1,
            created_at: Utc::now(),
        }
    }

    /// The same message, one delivery later
    pub fn redelivery(&self) -> Self {
        Self {
            delivery_attempt: self.delivery_attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Get message age in milliseconds
    pub fn age_ms(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
