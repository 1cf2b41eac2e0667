pub mod finding;

pub use finding::{Finding, Severity, Status};

use crate::collector::{CollectionResult, ScanTarget};
use crate::config::ScanSettings;
use crate::error::ScanError;
use crate::schema::EndpointId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Which scan-target shapes a plugin applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicabilityTag {
    Organization,
    Account,
}

impl ApplicabilityTag {
    pub fn for_target(target: &ScanTarget) -> Self {
        if target.organization {
            ApplicabilityTag::Organization
        } else {
            ApplicabilityTag::Account
        }
    }
}

/// Whether a provider restricts plugins by target shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplicabilityMode {
    #[default]
    Unrestricted,
    ByTargetShape,
}

/// Static description of a rule check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub id: String,
    pub title: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub recommended_action: String,
    pub required_endpoints: Vec<EndpointId>,
    /// Framework name (lowercase) -> clause text.
    #[serde(default)]
    pub compliance: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<ApplicabilityTag>,
}

impl PluginMeta {
    pub fn new(id: impl Into<String>, title: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category: category.into(),
            description: String::new(),
            recommended_action: String::new(),
            required_endpoints: Vec::new(),
            compliance: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn covers_any(&self, frameworks: &[String]) -> bool {
        frameworks.iter().any(|f| self.compliance.contains_key(f))
    }

    /// `CIS: clause; PCI: clause` for the frameworks of `filter` this plugin maps.
    pub fn compliance_label(&self, filter: &[String]) -> Option<String> {
        let parts: Vec<String> = filter
            .iter()
            .filter_map(|framework| {
                self.compliance
                    .get(framework)
                    .map(|clause| format!("{}: {}", framework.to_uppercase(), clause))
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("required data {0} was not collected")]
    MissingData(EndpointId),

    #[error("{0}")]
    Failed(String),

    #[error("plugin task panicked: {0}")]
    Panicked(String),
}

/// A rule check run against a completed collection.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn meta(&self) -> &PluginMeta;

    async fn run(
        &self,
        collection: &CollectionResult,
        settings: &ScanSettings,
    ) -> Result<Vec<Finding>, PluginError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plugin '{0}' is already registered")]
pub struct DuplicatePlugin(pub String);

/// Plugins of one provider keyed by id.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), DuplicatePlugin> {
        let id = plugin.meta().id.clone();
        if self.plugins.contains_key(&id) {
            return Err(DuplicatePlugin(id));
        }
        self.plugins.insert(id, plugin);
        Ok(())
    }

    pub fn with(mut self, plugin: impl Plugin + 'static) -> Result<Self, DuplicatePlugin> {
        self.register(Arc::new(plugin))?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(id)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.values()
    }

    /// Closest registered id to a misspelled one.
    pub fn suggest(&self, name: &str) -> Option<&str> {
        let mut best_match = None;
        let mut best_distance = usize::MAX;

        for id in self.plugins.keys() {
            let dist = strsim::damerau_levenshtein(&name.to_lowercase(), &id.to_lowercase());
            if dist < best_distance && dist <= 3 {
                best_distance = dist;
                best_match = Some(id.as_str());
            }
        }
        best_match
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.keys()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PluginFilter,
    TargetShape,
    Compliance,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::PluginFilter => "not selected",
            SkipReason::TargetShape => "not applicable to this target",
            SkipReason::Compliance => "no mapping for the selected compliance frameworks",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPlugin {
    pub id: String,
    pub reason: SkipReason,
}

/// Plugins selected to run, plus the ones filtered out.
#[derive(Clone, Default)]
pub struct ScanPlan {
    pub eligible: Vec<Arc<dyn Plugin>>,
    pub skipped: Vec<SkippedPlugin>,
}

impl ScanPlan {
    /// Endpoints needed by the eligible plugins, deduplicated in first-seen order.
    pub fn required_endpoints(&self) -> Vec<EndpointId> {
        let mut required: Vec<EndpointId> = Vec::new();
        for plugin in &self.eligible {
            for endpoint in &plugin.meta().required_endpoints {
                if !required.contains(endpoint) {
                    required.push(endpoint.clone());
                }
            }
        }
        required
    }

    pub fn eligible_ids(&self) -> Vec<&str> {
        self.eligible.iter().map(|p| p.meta().id.as_str()).collect()
    }
}

impl fmt::Debug for ScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPlan")
            .field("eligible", &self.eligible_ids())
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Decide which registered plugins run for this scan.
pub fn select_plugins(
    registry: &PluginRegistry,
    settings: &ScanSettings,
    target: &ScanTarget,
    mode: ApplicabilityMode,
) -> Result<ScanPlan, ScanError> {
    let only = settings.plugin.as_deref().map(str::trim).filter(|p| !p.is_empty());
    if let Some(name) = only {
        if registry.get(name).is_none() {
            return Err(ScanError::UnknownPlugin {
                name: name.to_string(),
                suggestion: registry.suggest(name).map(str::to_string),
            });
        }
    }

    let compliance = settings.compliance_filter();
    let shape = ApplicabilityTag::for_target(target);
    let mut plan = ScanPlan::default();

    for plugin in registry.iter() {
        let meta = plugin.meta();
        let reason = if only.is_some_and(|name| name != meta.id) {
            Some(SkipReason::PluginFilter)
        } else if mode == ApplicabilityMode::ByTargetShape && !meta.tags.contains(&shape) {
            Some(SkipReason::TargetShape)
        } else if !compliance.is_empty() && !meta.covers_any(&compliance) {
            Some(SkipReason::Compliance)
        } else {
            None
        };

        match reason {
            Some(reason) => plan.skipped.push(SkippedPlugin {
                id: meta.id.clone(),
                reason,
            }),
            None => plan.eligible.push(Arc::clone(plugin)),
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(PluginMeta);

    #[async_trait]
    impl Plugin for Fixed {
        fn meta(&self) -> &PluginMeta {
            &self.0
        }

        async fn run(&self, _: &CollectionResult, _: &ScanSettings) -> Result<Vec<Finding>, PluginError> {
            Ok(Vec::new())
        }
    }

    fn plugin(id: &str, endpoints: &[&str], compliance: &[(&str, &str)], tags: &[ApplicabilityTag]) -> Fixed {
        let mut meta = PluginMeta::new(id, id, "Test");
        meta.required_endpoints = endpoints.iter().map(|e| e.parse().unwrap()).collect();
        meta.compliance = compliance.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        meta.tags = tags.iter().copied().collect();
        Fixed(meta)
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new()
            .with(plugin("bucketPolicy", &["buckets:list", "buckets:getIamPolicy"], &[("cis", "5.1")], &[ApplicabilityTag::Account]))
            .unwrap()
            .with(plugin("openSsh", &["firewalls:list", "buckets:list"], &[("pci", "1.2"), ("cis", "3.6")], &[ApplicabilityTag::Account]))
            .unwrap()
            .with(plugin("orgPolicy", &["organizations:get"], &[], &[ApplicabilityTag::Organization]))
            .unwrap()
    }

    fn target() -> ScanTarget {
        ScanTarget {
            project_id: "demo".to_string(),
            ..ScanTarget::default()
        }
    }

    #[test]
    fn test_unfiltered_selection_dedups_endpoints() {
        let plan = select_plugins(&registry(), &ScanSettings::default(), &target(), ApplicabilityMode::Unrestricted).unwrap();
        assert_eq!(plan.eligible.len(), 3);
        let required: Vec<String> = plan.required_endpoints().iter().map(ToString::to_string).collect();
        assert_eq!(
            required,
            vec!["buckets:list", "buckets:getIamPolicy", "firewalls:list", "organizations:get"]
        );
    }

    #[test]
    fn test_compliance_filter_excludes_unmapped_plugins() {
        let settings = ScanSettings {
            compliance: vec!["PCI".to_string()],
            ..ScanSettings::default()
        };
        let plan = select_plugins(&registry(), &settings, &target(), ApplicabilityMode::Unrestricted).unwrap();
        assert_eq!(plan.eligible_ids(), vec!["openSsh"]);
        assert_eq!(plan.skipped.len(), 2);
        assert!(plan.skipped.iter().all(|s| s.reason == SkipReason::Compliance));
    }

    #[test]
    fn test_target_shape_filter() {
        let plan = select_plugins(&registry(), &ScanSettings::default(), &target(), ApplicabilityMode::ByTargetShape).unwrap();
        assert_eq!(plan.eligible_ids(), vec!["bucketPolicy", "openSsh"]);

        let org = ScanTarget {
            organization: true,
            ..target()
        };
        let plan = select_plugins(&registry(), &ScanSettings::default(), &org, ApplicabilityMode::ByTargetShape).unwrap();
        assert_eq!(plan.eligible_ids(), vec!["orgPolicy"]);
        assert_eq!(plan.skipped[0].reason, SkipReason::TargetShape);
    }

    #[test]
    fn test_single_plugin_filter_and_suggestion() {
        let settings = ScanSettings {
            plugin: Some("openSsh".to_string()),
            ..ScanSettings::default()
        };
        let plan = select_plugins(&registry(), &settings, &target(), ApplicabilityMode::Unrestricted).unwrap();
        assert_eq!(plan.eligible_ids(), vec!["openSsh"]);

        let settings = ScanSettings {
            plugin: Some("opnSsh".to_string()),
            ..ScanSettings::default()
        };
        match select_plugins(&registry(), &settings, &target(), ApplicabilityMode::Unrestricted) {
            Err(ScanError::UnknownPlugin { suggestion, .. }) => assert_eq!(suggestion.as_deref(), Some("openSsh")),
            other => panic!("expected UnknownPlugin, got {:?}", other.map(|p| p.eligible_ids().len())),
        }
    }

    #[test]
    fn test_compliance_label_follows_filter_order() {
        let meta = plugin("openSsh", &[], &[("pci", "1.2"), ("cis", "3.6")], &[]).0;
        assert_eq!(
            meta.compliance_label(&["cis".to_string(), "pci".to_string()]).as_deref(),
            Some("CIS: 3.6; PCI: 1.2")
        );
        assert_eq!(meta.compliance_label(&["hipaa".to_string()]), None);
        assert_eq!(meta.compliance_label(&[]), None);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = registry().with(plugin("openSsh", &[], &[], &[])).unwrap_err();
        assert_eq!(err, DuplicatePlugin("openSsh".to_string()));
    }
}
