use crate::schema::EndpointId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Location key used for endpoints without a region or zone.
pub const GLOBAL_LOCATION: &str = "global";

/// Failure marker for one request (or one resource instance of a dependent call).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub message: String,
    pub status: Option<u16>,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }
}

/// Per upstream-resource attribution inside a dependent endpoint's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    /// Substituted property values, joined with `/`.
    pub resource: String,
    pub record_count: usize,
    pub error: Option<CallError>,
}

/// Records returned for one endpoint in one location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub records: Vec<Value>,
    pub error: Option<CallError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceResult>,
}

impl LocationResult {
    pub fn ok(records: Vec<Value>) -> Self {
        Self {
            records,
            error: None,
            instances: Vec::new(),
        }
    }

    pub fn failed(error: CallError) -> Self {
        Self {
            records: Vec::new(),
            error: Some(error),
            instances: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Records produced by one upstream resource of a dependent endpoint.
    pub fn records_for(&self, resource: &str) -> Option<&[Value]> {
        let mut offset = 0;
        for instance in &self.instances {
            if instance.resource == resource {
                return self.records.get(offset..offset + instance.record_count);
            }
            offset += instance.record_count;
        }
        None
    }

    /// Append one resource instance's outcome. The location is marked failed
    /// only once every instance has failed.
    pub(crate) fn push_instance(
        &mut self,
        resource: String,
        records: Vec<Value>,
        error: Option<CallError>,
    ) {
        self.instances.push(InstanceResult {
            resource,
            record_count: records.len(),
            error: error.clone(),
        });
        self.records.extend(records);

        self.error = if self.instances.iter().all(|i| i.error.is_some()) {
            error
        } else {
            None
        };
    }
}

/// Records of one endpoint keyed by location.
pub type CallResult = BTreeMap<String, LocationResult>;

/// Everything the collector gathered for one scan:
/// service -> call -> location -> records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    services: BTreeMap<String, BTreeMap<String, CallResult>>,
}

impl CollectionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self, id: &EndpointId) -> Option<&CallResult> {
        self.get(&id.service, &id.call)
    }

    pub fn get(&self, service: &str, call: &str) -> Option<&CallResult> {
        self.services.get(service)?.get(call)
    }

    pub fn location(&self, service: &str, call: &str, location: &str) -> Option<&LocationResult> {
        self.get(service, call)?.get(location)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// True when at least one location of the endpoint completed without error.
    pub fn has_data(&self, id: &EndpointId) -> bool {
        self.call(id)
            .is_some_and(|locations| locations.values().any(LocationResult::is_ok))
    }

    pub fn total_records(&self) -> usize {
        self.services
            .values()
            .flat_map(|calls| calls.values())
            .flat_map(|locations| locations.values())
            .map(|l| l.records.len())
            .sum()
    }

    pub(crate) fn ensure_call(&mut self, id: &EndpointId) -> &mut CallResult {
        self.services
            .entry(id.service.clone())
            .or_default()
            .entry(id.call.clone())
            .or_default()
    }

    pub(crate) fn insert(&mut self, id: &EndpointId, location: String, result: LocationResult) {
        self.ensure_call(id).insert(location, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_for_uses_instance_offsets() {
        let mut location = LocationResult::default();
        location.push_instance("ring-a".into(), vec![json!({"k": 1}), json!({"k": 2})], None);
        location.push_instance("ring-b".into(), vec![], Some(CallError::new("denied")));
        location.push_instance("ring-c".into(), vec![json!({"k": 3})], None);

        assert!(location.is_ok());
        assert_eq!(location.records.len(), 3);
        assert_eq!(location.records_for("ring-a").unwrap().len(), 2);
        assert!(location.records_for("ring-b").unwrap().is_empty());
        assert_eq!(location.records_for("ring-c").unwrap(), &[json!({"k": 3})]);
        assert!(location.records_for("ring-z").is_none());
    }

    #[test]
    fn test_location_fails_only_when_every_instance_fails() {
        let mut location = LocationResult::default();
        location.push_instance("a".into(), vec![], Some(CallError::new("boom")));
        assert!(!location.is_ok());
        location.push_instance("b".into(), vec![json!({})], None);
        assert!(location.is_ok());
    }

    #[test]
    fn test_has_data() {
        let id = EndpointId::new("buckets", "list");
        let mut collection = CollectionResult::new();
        collection.insert(&id, GLOBAL_LOCATION.into(), LocationResult::failed(CallError::new("x")));
        assert!(!collection.has_data(&id));
        collection.insert(&id, "us-east1".into(), LocationResult::ok(vec![]));
        assert!(collection.has_data(&id));
        assert_eq!(collection.total_records(), 0);
    }
}
