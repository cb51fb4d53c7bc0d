//! Provider features and the per-item features that work items track.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Capability a provider implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Storyboard,
    Image,
    Audio,
    Video,
    VideoPrompt,
    MediaCompose,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Storyboard,
        Feature::Image,
        Feature::Audio,
        Feature::Video,
        Feature::VideoPrompt,
        Feature::MediaCompose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storyboard => "storyboard",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::VideoPrompt => "video_prompt",
            Self::MediaCompose => "media_compose",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the hyphenated spelling used by some API clients
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "storyboard" => Ok(Self::Storyboard),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "video_prompt" => Ok(Self::VideoPrompt),
            "media_compose" => Ok(Self::MediaCompose),
            _ => Err(format!("Invalid feature: {s}")),
        }
    }
}

/// Feature a work item tracks a sub-state for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemFeature {
    Image,
    Audio,
    Video,
    Merge,
}

impl ItemFeature {
    pub const ALL: [ItemFeature; 4] = [
        ItemFeature::Image,
        ItemFeature::Audio,
        ItemFeature::Video,
        ItemFeature::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Merge => "merge",
        }
    }

    /// Provider feature used to produce this item feature
    pub fn provider_feature(&self) -> Feature {
        match self {
            Self::Image => Feature::Image,
            Self::Audio => Feature::Audio,
            Self::Video => Feature::Video,
            Self::Merge => Feature::MediaCompose,
        }
    }

    /// Sub-states derived from this one; a re-run invalidates them
    pub fn downstream(&self) -> &'static [ItemFeature] {
        match self {
            Self::Image => &[ItemFeature::Video, ItemFeature::Merge],
            Self::Audio | Self::Video => &[ItemFeature::Merge],
            Self::Merge => &[],
        }
    }
}

impl fmt::Display for ItemFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "merge" => Ok(Self::Merge),
            _ => Err(format!("Invalid item feature: {s}")),
        }
    }
}

/// Per-task provider choice, keyed by feature.
///
/// Validated once at task creation against the registry; an absent feature falls
/// back to the registry default at resolution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderSelection(BTreeMap<Feature, String>);

impl ProviderSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: Feature, provider: impl Into<String>) -> Self {
        self.insert(feature, provider);
        self
    }

    pub fn insert(&mut self, feature: Feature, provider: impl Into<String>) {
        self.0
            .insert(feature, provider.into().trim().to_ascii_lowercase());
    }

    pub fn get(&self, feature: Feature) -> Option<&str> {
        self.0.get(&feature).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, &str)> {
        self.0.iter().map(|(f, p)| (*f, p.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Feature, String)> for ProviderSelection {
    fn from_iter<I: IntoIterator<Item = (Feature, String)>>(iter: I) -> Self {
        let mut selection = Self::new();
        for (feature, provider) in iter {
            selection.insert(feature, provider);
        }
        selection
    }
}
