use super::fanout::render_template;
use super::pagination::fetch_pages;
use super::postprocess::extract_records;
use super::transport::{ApiRequest, ApiTransport};
use super::{CollectOptions, ScanTarget};
use crate::schema::{EndpointId, HttpMethod, LocationBootstrap, LocationScope, Paging, PROJECT_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Which sovereign partition of a provider the scan runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionPartition {
    #[default]
    Standard,
    GovCloud,
    China,
}

impl RegionPartition {
    pub fn from_flags(govcloud: bool, china: bool) -> Self {
        match (govcloud, china) {
            (true, _) => RegionPartition::GovCloud,
            (false, true) => RegionPartition::China,
            _ => RegionPartition::Standard,
        }
    }

    /// Whether a region or zone name belongs to this partition.
    pub fn admits(&self, location: &str) -> bool {
        let gov = location.starts_with("us-gov-");
        let china = location.starts_with("cn-");
        match self {
            RegionPartition::Standard => !gov && !china,
            RegionPartition::GovCloud => gov,
            RegionPartition::China => china,
        }
    }
}

/// Regions and zones visible to the scanned account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSet {
    pub regions: Vec<String>,
    pub zones: Vec<String>,
}

impl LocationSet {
    pub fn for_scope(&self, scope: LocationScope) -> &[String] {
        match scope {
            LocationScope::Global => &[],
            LocationScope::Region => &self.regions,
            LocationScope::Zone => &self.zones,
        }
    }
}

pub(crate) async fn resolve(
    transport: &dyn ApiTransport,
    gate: &Semaphore,
    bootstrap: &LocationBootstrap,
    target: &ScanTarget,
    options: &CollectOptions,
    need_regions: bool,
    need_zones: bool,
) -> LocationSet {
    let mut set = LocationSet::default();
    if need_regions {
        set.regions = list_locations(
            transport,
            gate,
            bootstrap,
            bootstrap.regions_url.as_deref(),
            &bootstrap.fallback_regions,
            "regions",
            target,
            options,
        )
        .await;
    }
    if need_zones {
        set.zones = list_locations(
            transport,
            gate,
            bootstrap,
            bootstrap.zones_url.as_deref(),
            &bootstrap.fallback_zones,
            "zones",
            target,
            options,
        )
        .await;
    }
    info!(
        regions = set.regions.len(),
        zones = set.zones.len(),
        partition = ?options.partition,
        "resolved scan locations"
    );
    set
}

#[allow(clippy::too_many_arguments)]
async fn list_locations(
    transport: &dyn ApiTransport,
    gate: &Semaphore,
    bootstrap: &LocationBootstrap,
    url: Option<&str>,
    fallback: &[String],
    kind: &str,
    target: &ScanTarget,
    options: &CollectOptions,
) -> Vec<String> {
    let discovered = match url {
        Some(template) => discover(transport, gate, bootstrap, template, kind, target, options).await,
        None => Vec::new(),
    };

    let names = if discovered.is_empty() {
        fallback.to_vec()
    } else {
        discovered
    };

    names
        .into_iter()
        .filter(|name| options.partition.admits(name))
        .collect()
}

async fn discover(
    transport: &dyn ApiTransport,
    gate: &Semaphore,
    bootstrap: &LocationBootstrap,
    template: &str,
    kind: &str,
    target: &ScanTarget,
    options: &CollectOptions,
) -> Vec<String> {
    let vars = HashMap::from([(PROJECT_PLACEHOLDER.to_string(), target.project_id.clone())]);
    let url = match render_template(template, &vars) {
        Ok(url) => url,
        Err(token) => {
            warn!(kind, token = %token, "location bootstrap URL has an unbound placeholder; using fallback list");
            return Vec::new();
        }
    };

    let request = ApiRequest {
        endpoint: EndpointId::new("locations", kind),
        method: HttpMethod::Get,
        url,
        query: Vec::new(),
    };
    let paging = (!options.pagination_disabled).then(Paging::default);
    let records_key = bootstrap.records_key.as_str();
    let run = fetch_pages(transport, gate, request, paging.as_ref(), options.max_pages, |page| {
        page.get(records_key).and_then(Value::as_array).map_or(0, Vec::len)
    })
    .await;

    if let Some(error) = run.error {
        warn!(kind, %error, "location bootstrap failed; using fallback list");
        return Vec::new();
    }

    run.pages
        .iter()
        .flat_map(|page| extract_records(page, Some(records_key)))
        .filter_map(|record| {
            record
                .get(&bootstrap.name_field)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::transport::FixtureTransport;
    use serde_json::json;

    fn bootstrap() -> LocationBootstrap {
        LocationBootstrap {
            regions_url: Some("https://compute/projects/{projectId}/regions".to_string()),
            zones_url: Some("https://compute/projects/{projectId}/zones".to_string()),
            fallback_regions: vec!["us-central1".to_string(), "us-gov-west1".to_string()],
            fallback_zones: vec!["us-central1-a".to_string()],
            ..LocationBootstrap::default()
        }
    }

    fn target() -> ScanTarget {
        ScanTarget {
            project_id: "demo".to_string(),
            ..ScanTarget::default()
        }
    }

    #[test]
    fn test_partition_filter() {
        assert!(RegionPartition::Standard.admits("us-east1"));
        assert!(!RegionPartition::Standard.admits("us-gov-west-1"));
        assert!(RegionPartition::GovCloud.admits("us-gov-west-1"));
        assert!(RegionPartition::China.admits("cn-north-1"));
        assert!(!RegionPartition::China.admits("us-east1"));
        assert_eq!(RegionPartition::from_flags(false, true), RegionPartition::China);
    }

    #[tokio::test]
    async fn test_discovers_regions_and_skips_zones_when_unneeded() {
        let transport = FixtureTransport::new().respond(
            "https://compute/projects/demo/regions",
            json!({"items": [{"name": "us-east1"}, {"name": "europe-west1"}]}),
        );
        let gate = Semaphore::new(2);

        let set = resolve(&transport, &gate, &bootstrap(), &target(), &CollectOptions::default(), true, false).await;

        assert_eq!(set.regions, vec!["us-east1", "europe-west1"]);
        assert!(set.zones.is_empty());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_uses_partitioned_fallback() {
        let transport = FixtureTransport::new().fail("https://compute/projects/demo/regions", 403);
        let gate = Semaphore::new(2);

        let set = resolve(&transport, &gate, &bootstrap(), &target(), &CollectOptions::default(), true, false).await;
        assert_eq!(set.regions, vec!["us-central1"]);

        let options = CollectOptions {
            partition: RegionPartition::GovCloud,
            ..CollectOptions::default()
        };
        let set = resolve(&transport, &gate, &bootstrap(), &target(), &options, true, false).await;
        assert_eq!(set.regions, vec!["us-gov-west1"]);
    }
}
