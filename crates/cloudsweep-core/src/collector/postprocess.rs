//! Turning raw provider pages into ordered record sequences.

use super::locations::RegionPartition;
use super::result::GLOBAL_LOCATION;
use crate::schema::EndpointSpec;
use serde_json::Value;
use std::collections::BTreeMap;

/// Records carried by one response page.
pub(crate) fn extract_records(body: &Value, records_key: Option<&str>) -> Vec<Value> {
    match records_key {
        Some(key) => match body.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        None => vec![body.clone()],
    }
}

/// Number of records a page contributes, used to detect empty pages.
pub(crate) fn page_len(spec: &EndpointSpec, body: &Value) -> usize {
    if spec.aggregated {
        return aggregated_sections(body)
            .map(|(_, records)| records.len())
            .sum();
    }
    match spec.records_key.as_deref() {
        Some(key) => body.get(key).and_then(Value::as_array).map_or(0, Vec::len),
        None => 1,
    }
}

/// Split aggregated-listing pages into the per-location shape used by
/// location-scoped endpoints. Locations outside `partition` are dropped,
/// the same way the location bootstrap drops them.
pub(crate) fn partition_aggregated(
    pages: &[Value],
    partition: RegionPartition,
) -> BTreeMap<String, Vec<Value>> {
    let mut partitioned: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for page in pages {
        for (key, records) in aggregated_sections(page) {
            let location = location_from_key(key);
            if location != GLOBAL_LOCATION && !partition.admits(&location) {
                continue;
            }
            partitioned
                .entry(location)
                .or_default()
                .extend(records.iter().cloned());
        }
    }
    partitioned
}

fn aggregated_sections(body: &Value) -> impl Iterator<Item = (&str, &Vec<Value>)> {
    body.get("items")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|items| items.iter())
        .map(|(key, scoped)| {
            let records = scoped
                .as_object()
                .into_iter()
                .flat_map(|fields| fields.iter())
                .filter(|(field, _)| field.as_str() != "warning")
                .find_map(|(_, value)| value.as_array());
            (key.as_str(), records.unwrap_or(&EMPTY))
        })
}

static EMPTY: Vec<Value> = Vec::new();

/// `zones/us-central1-a` -> `us-central1-a`, `regions/us-east1` -> `us-east1`.
pub(crate) fn location_from_key(key: &str) -> String {
    match key.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ if key.is_empty() => GLOBAL_LOCATION.to_string(),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EndpointId, Tier};
    use serde_json::json;

    #[test]
    fn test_extract_records_by_key() {
        let body = json!({"items": [{"name": "a"}, {"name": "b"}], "nextPageToken": "x"});
        assert_eq!(extract_records(&body, Some("items")).len(), 2);
        assert!(extract_records(&json!({}), Some("items")).is_empty());
        assert_eq!(extract_records(&body, None), vec![body.clone()]);
    }

    #[test]
    fn test_partition_aggregated_pages() {
        let first = json!({
            "items": {
                "zones/us-central1-a": {"instances": [{"name": "vm-1"}, {"name": "vm-2"}]},
                "zones/us-east1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}},
            },
            "nextPageToken": "p2"
        });
        let second = json!({
            "items": {
                "zones/us-central1-a": {"instances": [{"name": "vm-3"}]},
                "regions/europe-west1": {"instances": [{"name": "vm-4"}]},
            }
        });

        let partitioned = partition_aggregated(&[first, second], RegionPartition::Standard);
        assert_eq!(partitioned["us-central1-a"].len(), 3);
        assert_eq!(partitioned["us-central1-a"][2]["name"], "vm-3");
        assert!(partitioned["us-east1-b"].is_empty());
        assert_eq!(partitioned["europe-west1"].len(), 1);
    }

    #[test]
    fn test_partition_aggregated_drops_foreign_locations() {
        let page = json!({
            "items": {
                "zones/us-east1-b": {"instances": [{"name": "vm-1"}]},
                "zones/us-gov-west1-a": {"instances": [{"name": "vm-2"}]},
                "global": {"instances": [{"name": "tmpl"}]},
            }
        });

        let partitioned = partition_aggregated(&[page], RegionPartition::GovCloud);
        assert_eq!(partitioned.keys().collect::<Vec<_>>(), vec!["global", "us-gov-west1-a"]);
    }

    #[test]
    fn test_page_len_for_aggregated_and_single() {
        let mut spec = EndpointSpec::new(EndpointId::new("disks", "aggregatedList"), Tier::Primary, "https://x");
        spec.aggregated = true;
        let page = json!({"items": {"zones/a": {"disks": [{}, {}]}, "zones/b": {"disks": [{}]}}});
        assert_eq!(page_len(&spec, &page), 3);

        let single = EndpointSpec::new(EndpointId::new("projects", "get"), Tier::Primary, "https://x");
        assert_eq!(page_len(&single, &json!({"name": "p"})), 1);
    }

    #[test]
    fn test_location_from_key() {
        assert_eq!(location_from_key("zones/us-central1-a"), "us-central1-a");
        assert_eq!(location_from_key("global"), "global");
        assert_eq!(location_from_key(""), "global");
    }
}
