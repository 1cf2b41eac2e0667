use super::required_call;
use crate::collector::CollectionResult;
use crate::config::ScanSettings;
use crate::plugin::{ApplicabilityTag, Finding, Plugin, PluginError, PluginMeta, PluginRegistry, Status};
use async_trait::async_trait;
use serde_json::Value;

const PUBLIC_MEMBERS: [&str; 2] = ["allUsers", "allAuthenticatedUsers"];
const OPEN_RANGES: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// Maximum KMS key rotation period, in days.
pub const KEY_ROTATION_MAX_DAYS: u64 = 90;

fn meta(
    id: &str,
    title: &str,
    category: &str,
    description: &str,
    recommended_action: &str,
    endpoints: &[&str],
    compliance: &[(&str, &str)],
) -> PluginMeta {
    let mut meta = PluginMeta::new(id, title, category);
    meta.description = description.to_string();
    meta.recommended_action = recommended_action.to_string();
    meta.required_endpoints = endpoints.iter().filter_map(|e| e.parse().ok()).collect();
    meta.compliance = compliance
        .iter()
        .map(|(framework, clause)| (framework.to_string(), clause.to_string()))
        .collect();
    meta.tags.insert(ApplicabilityTag::Account);
    meta
}

/// Every built-in Google Cloud check.
pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    let plugins: [std::sync::Arc<dyn Plugin>; 4] = [
        std::sync::Arc::new(BucketAllUsersPolicy::new()),
        std::sync::Arc::new(OpenFirewallPort::ssh()),
        std::sync::Arc::new(OpenFirewallPort::rdp()),
        std::sync::Arc::new(KmsKeyRotation::new()),
    ];
    for plugin in plugins {
        if let Err(duplicate) = registry.register(plugin) {
            tracing::error!(%duplicate, "built-in plugin ids collide");
        }
    }
    registry
}

/// Storage buckets must not grant access to `allUsers` or `allAuthenticatedUsers`.
pub struct BucketAllUsersPolicy {
    meta: PluginMeta,
}

impl BucketAllUsersPolicy {
    pub fn new() -> Self {
        Self {
            meta: meta(
                "bucketAllUsersPolicy",
                "Storage Bucket All Users Policy",
                "Storage",
                "Ensures Storage bucket policies do not allow global write, delete, or read permissions",
                "Remove allUsers and allAuthenticatedUsers members from the bucket IAM policy.",
                &["buckets:list", "buckets:getIamPolicy"],
                &[
                    ("cis", "5.1 Ensure that Cloud Storage bucket is not anonymously or publicly accessible"),
                    ("pci", "PCI requires that cardholder data is only accessible by authorized users"),
                    ("hipaa", "HIPAA requires that access to protected data is restricted to named individuals"),
                ],
            ),
        }
    }
}

impl Default for BucketAllUsersPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn public_roles(policy: &Value) -> Vec<String> {
    policy
        .get("bindings")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|binding| {
            binding
                .get("members")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .any(|member| PUBLIC_MEMBERS.contains(&member))
        })
        .filter_map(|binding| binding.get("role").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Plugin for BucketAllUsersPolicy {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    async fn run(&self, collection: &CollectionResult, _settings: &ScanSettings) -> Result<Vec<Finding>, PluginError> {
        let buckets = required_call(collection, "buckets:list")?;
        let policies = required_call(collection, "buckets:getIamPolicy")?;
        let mut findings = Vec::new();

        for (location, listed) in buckets {
            if let Some(error) = &listed.error {
                findings.push(
                    Finding::new(Status::Unknown, format!("Unable to query storage buckets: {}", error.message))
                        .with_region(location.as_str()),
                );
                continue;
            }
            if listed.records.is_empty() {
                findings.push(Finding::ok("No storage buckets found").with_region(location.as_str()));
                continue;
            }

            let Some(location_policies) = policies.get(location) else {
                continue;
            };
            for instance in &location_policies.instances {
                if let Some(error) = &instance.error {
                    findings.push(
                        Finding::new(Status::Unknown, format!("Unable to query bucket IAM policy: {}", error.message))
                            .with_resource(instance.resource.as_str())
                            .with_region(location.as_str()),
                    );
                    continue;
                }

                let roles: Vec<String> = location_policies
                    .records_for(&instance.resource)
                    .unwrap_or_default()
                    .iter()
                    .flat_map(public_roles)
                    .collect();

                let finding = if roles.is_empty() {
                    Finding::ok("No public access granted by the bucket policy")
                } else {
                    Finding::fail(format!(
                        "Bucket policy grants public access through: {}",
                        roles.join(" ")
                    ))
                };
                findings.push(
                    finding
                        .with_resource(instance.resource.as_str())
                        .with_region(location.as_str()),
                );
            }
        }

        Ok(findings)
    }
}

/// Firewall rules must not expose a management port to the whole internet.
pub struct OpenFirewallPort {
    meta: PluginMeta,
    port: u16,
    service: &'static str,
}

impl OpenFirewallPort {
    pub fn ssh() -> Self {
        Self {
            meta: meta(
                "openSSH",
                "Open SSH",
                "VPC Network",
                "Determines if TCP port 22 for SSH is open to the public",
                "Restrict TCP port 22 to known IP addresses.",
                &["firewalls:list"],
                &[
                    ("cis", "3.6 Ensure that SSH access is restricted from the internet"),
                    ("pci", "PCI has explicit requirements around firewalled access to systems"),
                ],
            ),
            port: 22,
            service: "SSH",
        }
    }

    pub fn rdp() -> Self {
        Self {
            meta: meta(
                "openRDP",
                "Open RDP",
                "VPC Network",
                "Determines if TCP port 3389 for RDP is open to the public",
                "Restrict TCP port 3389 to known IP addresses.",
                &["firewalls:list"],
                &[
                    ("cis", "3.7 Ensure that RDP access is restricted from the internet"),
                    ("pci", "PCI has explicit requirements around firewalled access to systems"),
                ],
            ),
            port: 3389,
            service: "RDP",
        }
    }

    /// Whether an enabled ingress rule allows the port from any address.
    pub fn exposes(&self, rule: &Value) -> bool {
        let ingress = rule
            .get("direction")
            .and_then(Value::as_str)
            .map_or(true, |direction| direction == "INGRESS");
        let disabled = rule.get("disabled").and_then(Value::as_bool).unwrap_or(false);
        let open_source = rule
            .get("sourceRanges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .any(|range| OPEN_RANGES.contains(&range));

        ingress
            && !disabled
            && open_source
            && rule
                .get("allowed")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .any(|allowed| self.allows_port(allowed))
    }

    fn allows_port(&self, allowed: &Value) -> bool {
        let protocol = allowed
            .get("IPProtocol")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if protocol != "tcp" && protocol != "all" {
            return false;
        }

        match allowed.get("ports").and_then(Value::as_array) {
            None => true,
            Some(ports) => ports
                .iter()
                .filter_map(Value::as_str)
                .any(|spec| port_in_spec(self.port, spec)),
        }
    }
}

fn port_in_spec(port: u16, spec: &str) -> bool {
    match spec.split_once('-') {
        Some((low, high)) => match (low.trim().parse::<u16>(), high.trim().parse::<u16>()) {
            (Ok(low), Ok(high)) => (low..=high).contains(&port),
            _ => false,
        },
        None => spec.trim().parse::<u16>() == Ok(port),
    }
}

#[async_trait]
impl Plugin for OpenFirewallPort {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    async fn run(&self, collection: &CollectionResult, _settings: &ScanSettings) -> Result<Vec<Finding>, PluginError> {
        let firewalls = required_call(collection, "firewalls:list")?;
        let mut findings = Vec::new();

        for (location, listed) in firewalls {
            if let Some(error) = &listed.error {
                findings.push(
                    Finding::new(Status::Unknown, format!("Unable to query firewall rules: {}", error.message))
                        .with_region(location.as_str()),
                );
                continue;
            }
            if listed.records.is_empty() {
                findings.push(Finding::ok("No firewall rules found").with_region(location.as_str()));
                continue;
            }

            for rule in &listed.records {
                let name = rule.get("name").and_then(Value::as_str).unwrap_or("unnamed");
                let finding = if self.exposes(rule) {
                    Finding::fail(format!(
                        "Firewall rule allows {} on TCP port {} from the internet",
                        self.service, self.port
                    ))
                } else {
                    Finding::ok(format!("Firewall rule does not expose TCP port {}", self.port))
                };
                findings.push(finding.with_resource(name).with_region(location.as_str()));
            }
        }

        Ok(findings)
    }
}

/// Symmetric KMS keys must rotate at least every `KEY_ROTATION_MAX_DAYS`.
pub struct KmsKeyRotation {
    meta: PluginMeta,
}

impl KmsKeyRotation {
    pub fn new() -> Self {
        Self {
            meta: meta(
                "kmsKeyRotation",
                "KMS Key Rotation",
                "Cryptographic Keys",
                "Ensures KMS keys are rotated at least every 90 days",
                "Set a rotation period of 90 days or less on every symmetric key.",
                &["keyRings:list", "cryptoKeys:list"],
                &[
                    ("cis", "1.10 Ensure KMS encryption keys are rotated within a period of 90 days"),
                    ("hipaa", "HIPAA requires that encryption keys are rotated regularly"),
                    ("pci", "PCI requires cryptographic keys to be rotated at the end of their cryptoperiod"),
                ],
            ),
        }
    }
}

impl Default for KmsKeyRotation {
    fn default() -> Self {
        Self::new()
    }
}

/// `"7776000s"` -> 90.
fn rotation_days(key: &Value) -> Option<u64> {
    let seconds = key
        .get("rotationPeriod")
        .and_then(Value::as_str)?
        .trim_end_matches('s')
        .parse::<f64>()
        .ok()?;
    Some((seconds / 86_400.0).ceil() as u64)
}

#[async_trait]
impl Plugin for KmsKeyRotation {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    async fn run(&self, collection: &CollectionResult, _settings: &ScanSettings) -> Result<Vec<Finding>, PluginError> {
        let keys = required_call(collection, "cryptoKeys:list")?;
        let mut findings = Vec::new();

        for (location, listed) in keys {
            if let Some(error) = &listed.error {
                findings.push(
                    Finding::new(Status::Unknown, format!("Unable to query cryptographic keys: {}", error.message))
                        .with_region(location.as_str()),
                );
                continue;
            }

            let mut ring_failures = 0;
            for instance in &listed.instances {
                if let Some(error) = &instance.error {
                    ring_failures += 1;
                    findings.push(
                        Finding::new(Status::Unknown, format!("Unable to query cryptographic keys: {}", error.message))
                            .with_resource(instance.resource.as_str())
                            .with_region(location.as_str()),
                    );
                }
            }

            let symmetric: Vec<&Value> = listed
                .records
                .iter()
                .filter(|key| {
                    key.get("purpose")
                        .and_then(Value::as_str)
                        .map_or(true, |purpose| purpose == "ENCRYPT_DECRYPT")
                })
                .collect();
            if symmetric.is_empty() {
                if ring_failures == 0 {
                    findings.push(Finding::ok("No symmetric cryptographic keys found").with_region(location.as_str()));
                }
                continue;
            }

            for key in symmetric {
                let name = key.get("name").and_then(Value::as_str).unwrap_or("unnamed");
                let finding = match rotation_days(key) {
                    None => Finding::fail("Key rotation is not enabled"),
                    Some(days) if days > KEY_ROTATION_MAX_DAYS => Finding::fail(format!(
                        "Key rotation period of {} days is greater than {} days",
                        days, KEY_ROTATION_MAX_DAYS
                    )),
                    Some(days) => Finding::ok(format!("Key rotation period of {} days is within limits", days)),
                };
                findings.push(finding.with_resource(name).with_region(location.as_str()));
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CallError, LocationResult};
    use crate::schema::{google_catalog, EndpointId};
    use serde_json::json;

    fn collection(entries: Vec<(&str, &str, LocationResult)>) -> CollectionResult {
        let mut collection = CollectionResult::new();
        for (id, location, result) in entries {
            let id: EndpointId = id.parse().unwrap();
            collection.insert(&id, location.to_string(), result);
        }
        collection
    }

    #[test]
    fn test_builtin_checks_only_require_catalog_endpoints() {
        let graph = google_catalog().unwrap();
        let registry = registry();
        assert_eq!(registry.len(), 4);
        for plugin in registry.iter() {
            assert!(!plugin.meta().required_endpoints.is_empty());
            for endpoint in &plugin.meta().required_endpoints {
                assert!(graph.get(endpoint).is_some(), "{} is not in the catalog", endpoint);
            }
        }
    }

    #[tokio::test]
    async fn test_bucket_policy() {
        let mut policies = LocationResult::default();
        policies.push_instance(
            "public-assets".to_string(),
            vec![json!({"bindings": [{"role": "roles/storage.objectViewer", "members": ["allUsers"]}]})],
            None,
        );
        policies.push_instance(
            "private".to_string(),
            vec![json!({"bindings": [{"role": "roles/storage.admin", "members": ["user:a@example.com"]}]})],
            None,
        );
        let collection = collection(vec![
            ("buckets:list", "global", LocationResult::ok(vec![json!({"name": "public-assets"}), json!({"name": "private"})])),
            ("buckets:getIamPolicy", "global", policies),
        ]);

        let findings = BucketAllUsersPolicy::new()
            .run(&collection, &ScanSettings::default())
            .await
            .unwrap();

        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].status, Status::Fail);
        assert!(findings[0].message.contains("roles/storage.objectViewer"));
        assert_eq!(findings[1].status, Status::Ok);
        assert_eq!(findings[1].resource.as_deref(), Some("private"));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_plugin_error() {
        let err = BucketAllUsersPolicy::new()
            .run(&CollectionResult::new(), &ScanSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::MissingData(_)));
    }

    #[test]
    fn test_firewall_exposure() {
        let ssh = OpenFirewallPort::ssh();
        let open = json!({
            "name": "default-allow-ssh",
            "direction": "INGRESS",
            "sourceRanges": ["0.0.0.0/0"],
            "allowed": [{"IPProtocol": "tcp", "ports": ["20-30"]}]
        });
        assert!(ssh.exposes(&open));
        assert!(!OpenFirewallPort::rdp().exposes(&open));

        let internal = json!({"sourceRanges": ["10.0.0.0/8"], "allowed": [{"IPProtocol": "all"}]});
        assert!(!ssh.exposes(&internal));

        let disabled = json!({"disabled": true, "sourceRanges": ["::/0"], "allowed": [{"IPProtocol": "tcp"}]});
        assert!(!ssh.exposes(&disabled));

        let egress = json!({"direction": "EGRESS", "sourceRanges": ["0.0.0.0/0"], "allowed": [{"IPProtocol": "tcp"}]});
        assert!(!ssh.exposes(&egress));
    }

    #[tokio::test]
    async fn test_key_rotation() {
        let collection = collection(vec![
            (
                "cryptoKeys:list",
                "us-east1",
                LocationResult::ok(vec![
                    json!({"name": "k-fast", "purpose": "ENCRYPT_DECRYPT", "rotationPeriod": "7776000s"}),
                    json!({"name": "k-slow", "purpose": "ENCRYPT_DECRYPT", "rotationPeriod": "31536000s"}),
                    json!({"name": "k-none", "purpose": "ENCRYPT_DECRYPT"}),
                    json!({"name": "k-sign", "purpose": "ASYMMETRIC_SIGN"}),
                ]),
            ),
            ("cryptoKeys:list", "europe-west1", LocationResult::ok(vec![])),
        ]);

        let findings = KmsKeyRotation::new()
            .run(&collection, &ScanSettings::default())
            .await
            .unwrap();

        let statuses: Vec<(Option<&str>, Status)> = findings
            .iter()
            .map(|f| (f.resource.as_deref(), f.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (None, Status::Ok),
                (Some("k-fast"), Status::Ok),
                (Some("k-slow"), Status::Fail),
                (Some("k-none"), Status::Fail),
            ]
        );
    }

    #[tokio::test]
    async fn test_key_rotation_reports_unreadable_key_ring() {
        let mut listed = LocationResult::default();
        listed.push_instance(
            "projects/demo/locations/us-east1/keyRings/locked".to_string(),
            Vec::new(),
            Some(CallError {
                message: "HTTP 403".to_string(),
                status: Some(403),
            }),
        );
        listed.push_instance(
            "projects/demo/locations/us-east1/keyRings/app".to_string(),
            vec![json!({"name": "k-app", "purpose": "ENCRYPT_DECRYPT", "rotationPeriod": "2592000s"})],
            None,
        );
        let collection = collection(vec![("cryptoKeys:list", "us-east1", listed)]);

        let findings = KmsKeyRotation::new()
            .run(&collection, &ScanSettings::default())
            .await
            .unwrap();

        let statuses: Vec<(Option<&str>, Status)> = findings
            .iter()
            .map(|f| (f.resource.as_deref(), f.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (Some("projects/demo/locations/us-east1/keyRings/locked"), Status::Unknown),
                (Some("k-app"), Status::Ok),
            ]
        );
        assert!(findings[0].message.contains("403"));
    }

    #[test]
    fn test_port_specs() {
        assert!(port_in_spec(22, "22"));
        assert!(port_in_spec(3389, "3000-4000"));
        assert!(!port_in_spec(22, "80"));
        assert!(!port_in_spec(22, "x-y"));
    }
}
