use crate::checks;
use crate::error::ScanError;
use crate::plugin::{ApplicabilityMode, PluginRegistry};
use crate::schema::{google_catalog, CallGraph};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cloud provider: its call graph and the checks that run against it.
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub call_graph: Arc<CallGraph>,
    pub plugins: PluginRegistry,
    pub applicability: ApplicabilityMode,
}

impl Provider {
    /// Every endpoint a registered plugin requires must exist in the call graph.
    pub fn new(
        id: impl Into<String>,
        call_graph: CallGraph,
        plugins: PluginRegistry,
        applicability: ApplicabilityMode,
    ) -> Result<Self, ScanError> {
        let id = id.into();
        for plugin in plugins.iter() {
            let meta = plugin.meta();
            if let Some(missing) = meta
                .required_endpoints
                .iter()
                .find(|endpoint| call_graph.get(endpoint).is_none())
            {
                return Err(ScanError::Configuration(format!(
                    "plugin '{}' of provider '{}' requires unknown endpoint {}",
                    meta.id, id, missing
                )));
            }
        }

        Ok(Self {
            id,
            call_graph: Arc::new(call_graph),
            plugins,
            applicability,
        })
    }

    pub fn google() -> Result<Self, ScanError> {
        Self::new(
            "google",
            google_catalog()?,
            checks::google::registry(),
            ApplicabilityMode::Unrestricted,
        )
    }
}

/// Providers available to the engine, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self, ScanError> {
        let mut registry = Self::new();
        registry.register(Provider::google()?);
        Ok(registry)
    }

    pub fn register(&mut self, provider: Provider) {
        self.providers.insert(provider.id.clone(), provider);
    }

    pub fn get(&self, id: &str) -> Result<&Provider, ScanError> {
        self.providers
            .get(id)
            .ok_or_else(|| ScanError::UnknownProvider(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
