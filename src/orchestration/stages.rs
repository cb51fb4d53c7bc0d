//! # Stage Plan
//!
//! The ordered list of stages a task runs through, and what each stage operates on.
//!
//! Stage definitions are fixed; configuration only picks which of them run and in what
//! order. Every stage name maps to exactly one step per task.

use crate::config::PipelineStagesConfig;
use crate::constants::stages;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Feature, ItemFeature, StepTemplate};
use std::fmt;

/// What a stage executes over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Produces the task's work items from its script
    Storyboard,
    /// Fans out over work items, one sub-state per item
    PerItem(ItemFeature),
    /// One provider call for the whole task
    TaskLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: &'static str,
    pub kind: StageKind,
    /// Provider feature used by the stage
    pub feature: Feature,
}

impl StageDefinition {
    pub fn item_feature(&self) -> Option<ItemFeature> {
        match self.kind {
            StageKind::PerItem(feature) => Some(feature),
            _ => None,
        }
    }
}

impl fmt::Display for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub const KNOWN_STAGES: [StageDefinition; 7] = [
    StageDefinition {
        name: stages::STORYBOARD,
        kind: StageKind::Storyboard,
        feature: Feature::Storyboard,
    },
    StageDefinition {
        name: stages::GENERATE_IMAGES,
        kind: StageKind::PerItem(ItemFeature::Image),
        feature: Feature::Image,
    },
    StageDefinition {
        name: stages::GENERATE_AUDIO,
        kind: StageKind::PerItem(ItemFeature::Audio),
        feature: Feature::Audio,
    },
    StageDefinition {
        name: stages::GENERATE_VIDEOS,
        kind: StageKind::PerItem(ItemFeature::Video),
        feature: Feature::Video,
    },
    StageDefinition {
        name: stages::MERGE_SCENE_MEDIA,
        kind: StageKind::PerItem(ItemFeature::Merge),
        feature: Feature::MediaCompose,
    },
    StageDefinition {
        name: stages::MERGE_VIDEO,
        kind: StageKind::TaskLevel,
        feature: Feature::MediaCompose,
    },
    StageDefinition {
        name: stages::FINALIZE_VIDEO,
        kind: StageKind::TaskLevel,
        feature: Feature::MediaCompose,
    },
];

pub fn definition(name: &str) -> Option<StageDefinition> {
    KNOWN_STAGES.iter().find(|d| d.name == name).copied()
}

/// Configured stage order plus per-step retry limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<StageDefinition>,
    step_max_retries: i32,
}

impl StagePlan {
    pub fn new(config: &PipelineStagesConfig, step_max_retries: i32) -> PipelineResult<Self> {
        let stages = config
            .stages
            .iter()
            .map(|name| {
                definition(name).ok_or_else(|| {
                    PipelineError::configuration(format!("unknown pipeline stage '{name}'"))
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        if stages.is_empty() {
            return Err(PipelineError::configuration(
                "pipeline must contain at least one stage",
            ));
        }
        Ok(Self {
            stages,
            step_max_retries,
        })
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Step templates with `seq` starting at 1
    pub fn templates(&self) -> Vec<StepTemplate> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| StepTemplate {
                seq: index as i32 + 1,
                name: stage.name.to_string(),
                max_retries: self.step_max_retries,
            })
            .collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|d| d.name == name)
    }

    /// Stage definition, rejecting names that are not part of this plan
    pub fn stage(&self, name: &str) -> PipelineResult<StageDefinition> {
        self.position(name)
            .map(|index| self.stages[index])
            .ok_or_else(|| PipelineError::validation(format!("unknown stage '{name}'")))
    }

    pub fn previous(&self, name: &str) -> Option<StageDefinition> {
        match self.position(name) {
            Some(index) if index > 0 => Some(self.stages[index - 1]),
            _ => None,
        }
    }

    pub fn next(&self, name: &str) -> Option<StageDefinition> {
        self.position(name)
            .and_then(|index| self.stages.get(index + 1))
            .copied()
    }

    pub fn is_last(&self, name: &str) -> bool {
        self.stages.last().map(|d| d.name) == Some(name)
    }

    /// The per-item stage that owns `feature`, if it is part of this plan
    pub fn stage_for_item(&self, feature: ItemFeature) -> Option<StageDefinition> {
        self.stages
            .iter()
            .find(|d| d.kind == StageKind::PerItem(feature))
            .copied()
    }

    pub fn has_storyboard(&self) -> bool {
        self.stages.iter().any(|d| d.kind == StageKind::Storyboard)
    }
}
