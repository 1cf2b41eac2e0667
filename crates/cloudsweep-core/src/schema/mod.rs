pub mod catalog;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub use catalog::{google_catalog, load_catalog, parse_catalog, LocationBootstrap};

/// Placeholder bound from the scan target.
pub const PROJECT_PLACEHOLDER: &str = "projectId";
/// Placeholder bound per location for region/zone scoped endpoints.
pub const LOCATION_PLACEHOLDER: &str = "locationId";

/// Identifier of one provider API call, written `service:call`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId {
    pub service: String,
    pub call: String,
}

impl EndpointId {
    pub fn new(service: impl Into<String>, call: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            call: call.into(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.call)
    }
}

impl FromStr for EndpointId {
    type Err = CallGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((service, call))
                if !service.is_empty() && !call.is_empty() && !call.contains(':') =>
            {
                Ok(Self::new(service, call))
            }
            _ => Err(CallGraphError::InvalidId(s.to_string())),
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = CallGraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.to_string()
    }
}

/// Dependency level governing collector execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Secondary,
    Tertiary,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Primary, Tier::Secondary, Tier::Tertiary];

    pub fn label(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationScope {
    #[default]
    Global,
    Region,
    Zone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Continuation-cursor settings for a paginated endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// Query parameter the cursor is sent back under.
    pub cursor_param: String,
    /// Response field the next cursor is read from.
    pub cursor_field: String,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            cursor_param: "pageToken".to_string(),
            cursor_field: "nextPageToken".to_string(),
        }
    }
}

/// One declarative API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: EndpointId,
    pub tier: Tier,
    pub url: String,
    pub method: HttpMethod,
    pub paging: Option<Paging>,
    pub scope: LocationScope,
    /// The provider returns every location in one response.
    pub aggregated: bool,
    pub depends_on: Vec<EndpointId>,
    /// Upstream resource fields substituted into the URL template.
    pub properties: Vec<String>,
    /// Path into the upstream resource applied before property extraction.
    pub sub_object: Vec<String>,
    /// Response field holding the record array. `None` means the body is one record.
    pub records_key: Option<String>,
}

impl EndpointSpec {
    pub fn new(id: EndpointId, tier: Tier, url: impl Into<String>) -> Self {
        Self {
            id,
            tier,
            url: url.into(),
            method: HttpMethod::Get,
            paging: None,
            scope: LocationScope::Global,
            aggregated: false,
            depends_on: Vec::new(),
            properties: Vec::new(),
            sub_object: Vec::new(),
            records_key: None,
        }
    }

    pub fn is_dependent(&self) -> bool {
        !self.depends_on.is_empty()
    }

    pub fn placeholders(&self) -> Vec<&str> {
        template_tokens(&self.url)
    }
}

/// Errors found while loading or validating a call graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallGraphError {
    #[error("invalid endpoint identifier '{0}', expected 'service:call'")]
    InvalidId(String),

    #[error("endpoint '{0}' is declared more than once")]
    Duplicate(EndpointId),

    #[error("endpoint '{id}' lists {services} relies_on_service entries but {calls} relies_on_call entries")]
    MismatchedDependencies {
        id: EndpointId,
        services: usize,
        calls: usize,
    },

    #[error("endpoint '{id}' depends on unknown endpoint '{dependency}'")]
    UnknownDependency {
        id: EndpointId,
        dependency: EndpointId,
    },

    #[error("dependency cycle detected at endpoint '{0}'")]
    Cycle(EndpointId),

    #[error("endpoint '{id}' ({tier}) depends on '{dependency}' ({dependency_tier}), which is not in an earlier tier")]
    TierOrder {
        id: EndpointId,
        tier: Tier,
        dependency: EndpointId,
        dependency_tier: Tier,
    },

    #[error("{tier} endpoint '{id}' must depend on at least one earlier endpoint")]
    MissingDependency { id: EndpointId, tier: Tier },

    #[error("aggregated endpoint '{0}' must be globally scoped")]
    AggregatedScope(EndpointId),

    #[error("{scope:?}-scoped endpoint '{id}' takes its location from global endpoint '{dependency}'")]
    GlobalUpstream {
        id: EndpointId,
        scope: LocationScope,
        dependency: EndpointId,
    },

    #[error("endpoint '{id}' uses placeholder '{{{placeholder}}}' that nothing binds")]
    UnboundPlaceholder { id: EndpointId, placeholder: String },

    #[error("failed to parse call catalog: {0}")]
    Parse(String),
}

/// Required endpoints expanded with their transitive dependencies.
#[derive(Debug, Clone, Default)]
pub struct Closure {
    pub endpoints: BTreeSet<EndpointId>,
    pub unknown: Vec<EndpointId>,
}

/// Validated, immutable set of endpoint descriptions for one provider.
#[derive(Debug, Clone)]
pub struct CallGraph {
    endpoints: BTreeMap<EndpointId, Arc<EndpointSpec>>,
    locations: LocationBootstrap,
}

impl CallGraph {
    /// Validate `specs` and build the graph. Nothing is accepted that could
    /// fail to resolve mid-scan.
    pub fn new(
        specs: Vec<EndpointSpec>,
        locations: LocationBootstrap,
    ) -> Result<Self, CallGraphError> {
        let mut endpoints = BTreeMap::new();
        for spec in specs {
            if endpoints.contains_key(&spec.id) {
                return Err(CallGraphError::Duplicate(spec.id));
            }
            endpoints.insert(spec.id.clone(), Arc::new(spec));
        }

        for spec in endpoints.values() {
            for dependency in &spec.depends_on {
                if !endpoints.contains_key(dependency) {
                    return Err(CallGraphError::UnknownDependency {
                        id: spec.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        check_acyclic(&endpoints)?;

        for spec in endpoints.values() {
            check_tiers(spec, &endpoints)?;
            if spec.aggregated && spec.scope != LocationScope::Global {
                return Err(CallGraphError::AggregatedScope(spec.id.clone()));
            }
            check_dependent_scope(spec, &endpoints)?;
            check_placeholders(spec)?;
        }

        Ok(Self {
            endpoints,
            locations,
        })
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Arc<EndpointSpec>> {
        self.endpoints.get(id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn locations(&self) -> &LocationBootstrap {
        &self.locations
    }

    /// Endpoints ordered by tier, then identifier.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointSpec>> {
        Tier::ALL
            .into_iter()
            .flat_map(move |tier| self.endpoints.values().filter(move |e| e.tier == tier))
    }

    pub fn in_tier(&self, tier: Tier) -> Vec<&Arc<EndpointSpec>> {
        self.endpoints.values().filter(|e| e.tier == tier).collect()
    }

    /// Expand `required` with every transitive dependency.
    pub fn closure(&self, required: &[EndpointId]) -> Closure {
        let mut closure = Closure::default();
        let mut stack: Vec<&EndpointId> = Vec::new();

        for id in required {
            if self.endpoints.contains_key(id) {
                stack.push(id);
            } else if !closure.unknown.contains(id) {
                closure.unknown.push(id.clone());
            }
        }

        while let Some(id) = stack.pop() {
            if !closure.endpoints.insert(id.clone()) {
                continue;
            }
            if let Some(spec) = self.endpoints.get(id) {
                stack.extend(spec.depends_on.iter());
            }
        }

        closure
    }
}

fn check_acyclic(endpoints: &BTreeMap<EndpointId, Arc<EndpointSpec>>) -> Result<(), CallGraphError> {
    let mut graph: DiGraph<&EndpointId, ()> = DiGraph::new();
    let mut nodes: HashMap<&EndpointId, NodeIndex> = HashMap::new();

    for id in endpoints.keys() {
        nodes.insert(id, graph.add_node(id));
    }
    for spec in endpoints.values() {
        for dependency in &spec.depends_on {
            if let (Some(&from), Some(&to)) = (nodes.get(dependency), nodes.get(&spec.id)) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| CallGraphError::Cycle(graph[cycle.node_id()].clone()))
}

fn check_tiers(
    spec: &EndpointSpec,
    endpoints: &BTreeMap<EndpointId, Arc<EndpointSpec>>,
) -> Result<(), CallGraphError> {
    if spec.tier != Tier::Primary && spec.depends_on.is_empty() {
        return Err(CallGraphError::MissingDependency {
            id: spec.id.clone(),
            tier: spec.tier,
        });
    }
    for dependency in &spec.depends_on {
        let Some(upstream) = endpoints.get(dependency) else {
            continue;
        };
        if upstream.tier >= spec.tier {
            return Err(CallGraphError::TierOrder {
                id: spec.id.clone(),
                tier: spec.tier,
                dependency: dependency.clone(),
                dependency_tier: upstream.tier,
            });
        }
    }
    Ok(())
}

/// A located dependent endpoint inherits its location from the first
/// dependency, which therefore has to produce per-location results.
fn check_dependent_scope(
    spec: &EndpointSpec,
    endpoints: &BTreeMap<EndpointId, Arc<EndpointSpec>>,
) -> Result<(), CallGraphError> {
    if spec.scope == LocationScope::Global {
        return Ok(());
    }
    let Some(upstream) = spec.depends_on.first().and_then(|id| endpoints.get(id)) else {
        return Ok(());
    };
    if upstream.scope == LocationScope::Global && !upstream.aggregated {
        return Err(CallGraphError::GlobalUpstream {
            id: spec.id.clone(),
            scope: spec.scope,
            dependency: upstream.id.clone(),
        });
    }
    Ok(())
}

fn check_placeholders(spec: &EndpointSpec) -> Result<(), CallGraphError> {
    for token in spec.placeholders() {
        let bound = token == PROJECT_PLACEHOLDER
            || (token == LOCATION_PLACEHOLDER && spec.scope != LocationScope::Global)
            || spec.properties.iter().any(|p| p == token);
        if !bound {
            return Err(CallGraphError::UnboundPlaceholder {
                id: spec.id.clone(),
                placeholder: token.to_string(),
            });
        }
    }
    Ok(())
}

/// Names of the `{token}` placeholders in a URL template, in order.
pub(crate) fn template_tokens(template: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                tokens.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    tokens
}
