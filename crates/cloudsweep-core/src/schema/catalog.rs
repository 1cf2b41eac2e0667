use super::{CallGraph, CallGraphError, EndpointId, EndpointSpec, HttpMethod, LocationScope, Paging, Tier};
use serde::{Deserialize, Serialize};
use std::path::Path;

const GOOGLE_CATALOG: &str = include_str!("../../catalog/google.toml");

/// How the collector discovers the regions and zones visible to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationBootstrap {
    #[serde(default)]
    pub regions_url: Option<String>,
    #[serde(default)]
    pub zones_url: Option<String>,
    /// Field of each listed location holding its name.
    #[serde(default = "default_name_field")]
    pub name_field: String,
    #[serde(default = "default_records_key")]
    pub records_key: String,
    /// Used when the bootstrap call fails.
    #[serde(default)]
    pub fallback_regions: Vec<String>,
    #[serde(default)]
    pub fallback_zones: Vec<String>,
}

impl Default for LocationBootstrap {
    fn default() -> Self {
        Self {
            regions_url: None,
            zones_url: None,
            name_field: default_name_field(),
            records_key: default_records_key(),
            fallback_regions: Vec::new(),
            fallback_zones: Vec::new(),
        }
    }
}

fn default_name_field() -> String {
    "name".to_string()
}

fn default_records_key() -> String {
    "items".to_string()
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    locations: LocationBootstrap,
    #[serde(default)]
    primary: Vec<RawEndpoint>,
    #[serde(default)]
    secondary: Vec<RawEndpoint>,
    #[serde(default)]
    tertiary: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    service: String,
    call: String,
    url: String,
    #[serde(default)]
    method: HttpMethod,
    #[serde(default)]
    pagination: bool,
    #[serde(default)]
    cursor_param: Option<String>,
    #[serde(default)]
    cursor_field: Option<String>,
    #[serde(default)]
    location: LocationScope,
    #[serde(default)]
    aggregated: bool,
    #[serde(default)]
    relies_on_service: Vec<String>,
    #[serde(default)]
    relies_on_call: Vec<String>,
    #[serde(default)]
    properties: Vec<String>,
    #[serde(default)]
    sub_object: Vec<String>,
    #[serde(default)]
    records_key: Option<String>,
}

impl RawEndpoint {
    fn into_spec(self, tier: Tier) -> Result<EndpointSpec, CallGraphError> {
        let id = EndpointId::new(self.service, self.call);
        if self.relies_on_service.len() != self.relies_on_call.len() {
            return Err(CallGraphError::MismatchedDependencies {
                id,
                services: self.relies_on_service.len(),
                calls: self.relies_on_call.len(),
            });
        }

        let depends_on = self
            .relies_on_service
            .into_iter()
            .zip(self.relies_on_call)
            .map(|(service, call)| EndpointId::new(service, call))
            .collect();

        let paging = self.pagination.then(|| {
            let defaults = Paging::default();
            Paging {
                cursor_param: self.cursor_param.unwrap_or(defaults.cursor_param),
                cursor_field: self.cursor_field.unwrap_or(defaults.cursor_field),
            }
        });

        Ok(EndpointSpec {
            id,
            tier,
            url: self.url,
            method: self.method,
            paging,
            scope: self.location,
            aggregated: self.aggregated,
            depends_on,
            properties: self.properties,
            sub_object: self.sub_object,
            records_key: self.records_key,
        })
    }
}

/// Parse and validate a TOML call catalog.
pub fn parse_catalog(source: &str) -> Result<CallGraph, CallGraphError> {
    let raw: RawCatalog =
        toml::from_str(source).map_err(|e| CallGraphError::Parse(e.to_string()))?;

    let mut specs = Vec::new();
    for (tier, entries) in [
        (Tier::Primary, raw.primary),
        (Tier::Secondary, raw.secondary),
        (Tier::Tertiary, raw.tertiary),
    ] {
        for entry in entries {
            specs.push(entry.into_spec(tier)?);
        }
    }

    CallGraph::new(specs, raw.locations)
}

/// Load a call catalog from a TOML file.
pub fn load_catalog(path: &Path) -> anyhow::Result<CallGraph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read call catalog '{}': {}", path.display(), e))?;
    let graph = parse_catalog(&content)
        .map_err(|e| anyhow::anyhow!("Invalid call catalog '{}': {}", path.display(), e))?;
    Ok(graph)
}

/// The built-in Google Cloud call graph.
pub fn google_catalog() -> Result<CallGraph, CallGraphError> {
    parse_catalog(GOOGLE_CATALOG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_google_catalog_is_valid() {
        let graph = google_catalog().unwrap();
        assert!(graph.len() > 50);

        let crypto = graph
            .get(&"cryptoKeys:getIamPolicy".parse().unwrap())
            .unwrap();
        assert_eq!(crypto.tier, Tier::Tertiary);
        assert_eq!(crypto.scope, LocationScope::Region);

        let aggregated = graph.get(&"compute:aggregatedList".parse().unwrap()).unwrap();
        assert!(aggregated.aggregated);
        assert!(aggregated.paging.is_some());

        let iam = graph.get(&"projects:getIamPolicy".parse().unwrap()).unwrap();
        assert_eq!(iam.method, HttpMethod::Post);
        assert!(iam.paging.is_none());

        assert!(graph.locations().regions_url.is_some());
        assert!(!graph.locations().fallback_zones.is_empty());
    }

    #[test]
    fn test_mismatched_relies_on_lists_rejected() {
        let source = r#"
[[primary]]
service = "a"
call = "list"
url = "https://a"

[[secondary]]
service = "b"
call = "get"
url = "https://b/{id}"
relies_on_service = ["a", "a"]
relies_on_call = ["list"]
properties = ["id"]
"#;
        let err = parse_catalog(source).unwrap_err();
        assert!(matches!(
            err,
            CallGraphError::MismatchedDependencies { services: 2, calls: 1, .. }
        ));
    }

    #[test]
    fn test_custom_cursor_names() {
        let source = r#"
[[primary]]
service = "a"
call = "list"
url = "https://a"
pagination = true
cursor_param = "marker"
cursor_field = "nextMarker"
"#;
        let graph = parse_catalog(source).unwrap();
        let spec = graph.get(&EndpointId::new("a", "list")).unwrap();
        let paging = spec.paging.as_ref().unwrap();
        assert_eq!(paging.cursor_param, "marker");
        assert_eq!(paging.cursor_field, "nextMarker");
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            parse_catalog("[[primary]]\nservice = 3"),
            Err(CallGraphError::Parse(_))
        ));
    }
}
