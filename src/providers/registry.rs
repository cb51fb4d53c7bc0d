//! # Provider Registry
//!
//! In-process registry mapping (feature, provider name) to a provider instance.
//!
//! A task's [`ProviderSelection`] is validated once when the task is created, so an
//! unknown provider name fails fast at the API boundary instead of surfacing mid-run.
//! Each step execution then takes a [`ProviderSnapshot`]: the task selection merged over
//! the static defaults and resolved to concrete instances. The snapshot is never
//! mutated afterwards; reconfiguring the registry only affects later snapshots.

use super::Provider;
use crate::config::ProviderDefaultsConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Feature, ProviderSelection};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

type ProviderKey = (Feature, String);

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_providers: usize,
    pub features_with_default: usize,
}

pub struct ProviderRegistry {
    providers: HashMap<ProviderKey, Arc<dyn Provider>>,
    defaults: RwLock<BTreeMap<Feature, String>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .providers
            .keys()
            .map(|(feature, name)| format!("{feature}:{name}"))
            .collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .field("defaults", &*self.defaults.read())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            defaults: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build with the static defaults from configuration
    pub fn from_config(config: &ProviderDefaultsConfig) -> Self {
        let registry = Self::new();
        registry.with_defaults(config.defaults.clone());
        registry
    }

    /// Register a provider under its own feature and name; replaces any previous entry
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        let key = (provider.feature(), provider.name().trim().to_ascii_lowercase());
        debug!(feature = %key.0, provider = %key.1, "Registering provider");
        self.providers.insert(key, provider);
        self
    }

    /// Replace the static fallback map. Snapshots already taken are unaffected.
    pub fn with_defaults(&self, defaults: BTreeMap<Feature, String>) {
        let normalized: BTreeMap<Feature, String> = defaults
            .into_iter()
            .map(|(feature, name)| (feature, name.trim().to_ascii_lowercase()))
            .collect();
        info!(defaults = normalized.len(), "🔌 Provider defaults applied");
        *self.defaults.write() = normalized;
    }

    pub fn get(&self, feature: Feature, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .get(&(feature, name.trim().to_ascii_lowercase()))
            .cloned()
    }

    /// Reject selections naming a provider that is not registered for that feature
    pub fn validate_selection(&self, selection: &ProviderSelection) -> PipelineResult<()> {
        for (feature, name) in selection.iter() {
            if self.get(feature, name).is_none() {
                return Err(PipelineError::validation(format!(
                    "Unknown provider '{name}' for feature {feature}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve every feature for one execution: task selection first, then defaults
    pub fn snapshot(&self, selection: &ProviderSelection) -> ProviderSnapshot {
        let defaults = self.defaults.read();
        let mut resolved = BTreeMap::new();
        let mut unresolved = BTreeMap::new();

        for feature in Feature::ALL {
            let name = selection
                .get(feature)
                .or_else(|| defaults.get(&feature).map(String::as_str));
            match name {
                Some(name) => match self.get(feature, name) {
                    Some(provider) => {
                        resolved.insert(feature, provider);
                    }
                    None => {
                        unresolved.insert(
                            feature,
                            format!("provider '{name}' is not registered for {feature}"),
                        );
                    }
                },
                None => {
                    unresolved.insert(feature, format!("no provider configured for {feature}"));
                }
            }
        }

        ProviderSnapshot {
            resolved,
            unresolved,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_providers: self.providers.len(),
            features_with_default: self.defaults.read().len(),
        }
    }
}

/// Immutable per-execution provider resolution
#[derive(Clone, Default)]
pub struct ProviderSnapshot {
    resolved: BTreeMap<Feature, Arc<dyn Provider>>,
    unresolved: BTreeMap<Feature, String>,
}

impl fmt::Debug for ProviderSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved: BTreeMap<Feature, &str> = self
            .resolved
            .iter()
            .map(|(feature, provider)| (*feature, provider.name()))
            .collect();
        f.debug_struct("ProviderSnapshot")
            .field("resolved", &resolved)
            .field("unresolved", &self.unresolved)
            .finish()
    }
}

impl ProviderSnapshot {
    /// The provider for `feature`, or a `ConfigurationError` explaining why there is none
    pub fn provider(&self, feature: Feature) -> PipelineResult<Arc<dyn Provider>> {
        match self.resolved.get(&feature) {
            Some(provider) => Ok(provider.clone()),
            None => Err(PipelineError::configuration(
                self.unresolved
                    .get(&feature)
                    .cloned()
                    .unwrap_or_else(|| format!("no provider configured for {feature}")),
            )),
        }
    }

    pub fn try_provider(&self, feature: Feature) -> Option<Arc<dyn Provider>> {
        self.resolved.get(&feature).cloned()
    }

    pub fn provider_name(&self, feature: Feature) -> Option<&str> {
        self.resolved.get(&feature).map(|p| p.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{ProviderOutcome, ProviderRequest};
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        feature: Feature,
    }

    #[async_trait]
    impl Provider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn feature(&self) -> Feature {
            self.feature
        }

        async fn generate(
            &self,
            _request: &ProviderRequest,
        ) -> Result<ProviderOutcome, ProviderError> {
            Ok(ProviderOutcome::completed(format!("{}.bin", self.name)))
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "runninghub", feature: Feature::Image }))
            .register(Arc::new(Fixed { name: "fal", feature: Feature::Image }))
            .register(Arc::new(Fixed { name: "elevenlabs", feature: Feature::Audio }));
        registry.with_defaults(BTreeMap::from([
            (Feature::Image, "RunningHub".to_string()),
            (Feature::Audio, "elevenlabs".to_string()),
        ]));
        registry
    }

    #[test]
    fn test_selection_overrides_default() {
        let registry = registry();
        let snapshot = registry.snapshot(&ProviderSelection::new().with(Feature::Image, "fal"));
        assert_eq!(snapshot.provider_name(Feature::Image), Some("fal"));
        assert_eq!(snapshot.provider_name(Feature::Audio), Some("elevenlabs"));
    }

    #[test]
    fn test_unresolved_feature_is_configuration_error() {
        let snapshot = registry().snapshot(&ProviderSelection::new());
        let err = snapshot.provider(Feature::Video).err().unwrap();
        assert!(matches!(err, PipelineError::ConfigurationError(_)));
        assert!(snapshot.try_provider(Feature::Video).is_none());
    }

    #[test]
    fn test_validate_selection_fails_fast() {
        let registry = registry();
        assert!(registry
            .validate_selection(&ProviderSelection::new().with(Feature::Image, "fal"))
            .is_ok());
        let err = registry
            .validate_selection(&ProviderSelection::new().with(Feature::Audio, "fal"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ValidationError(_)));
    }

    #[test]
    fn test_snapshot_is_isolated_from_reconfiguration() {
        let registry = registry();
        let snapshot = registry.snapshot(&ProviderSelection::new());
        registry.with_defaults(BTreeMap::from([(Feature::Image, "fal".to_string())]));
        assert_eq!(snapshot.provider_name(Feature::Image), Some("runninghub"));
        assert_eq!(
            registry
                .snapshot(&ProviderSelection::new())
                .provider_name(Feature::Image),
            Some("fal")
        );
        assert_eq!(registry.stats().features_with_default, 1);
    }
}
