use crate::collector::{CollectOptions, RegionPartition, ScanTarget};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Scan settings loaded from `cloudsweep.toml` (or a YAML equivalent) and
/// overridden from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Provider id, e.g. `google`.
    pub cloud: String,

    /// Run only this plugin.
    pub plugin: Option<String>,

    /// Compliance frameworks to restrict the scan to (e.g. `["cis", "pci"]`).
    pub compliance: Vec<String>,

    /// Drop OK findings from every output sink.
    pub ignore_ok: bool,

    /// Suppression rules of the form `pluginId:region:resource`.
    pub suppress: Vec<String>,

    pub skip_paginate: bool,
    pub govcloud: bool,
    pub china: bool,

    /// The target is an organization rather than a single project.
    pub organization: bool,

    pub concurrency: ConcurrencySettings,
    pub http: HttpSettings,
    pub output: OutputSettings,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            cloud: "google".to_string(),
            plugin: None,
            compliance: Vec::new(),
            ignore_ok: false,
            suppress: Vec::new(),
            skip_paginate: false,
            govcloud: false,
            china: false,
            organization: false,
            concurrency: ConcurrencySettings::default(),
            http: HttpSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl ScanSettings {
    pub fn partition(&self) -> RegionPartition {
        RegionPartition::from_flags(self.govcloud, self.china)
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            pagination_disabled: self.skip_paginate,
            partition: self.partition(),
            max_in_flight: self.concurrency.api_requests.max(1),
            ..CollectOptions::default()
        }
    }

    /// Active compliance filter, lowercased, without blanks or duplicates.
    pub fn compliance_filter(&self) -> Vec<String> {
        let mut filter: Vec<String> = Vec::new();
        for name in &self.compliance {
            let name = name.trim().to_lowercase();
            if !name.is_empty() && !filter.contains(&name) {
                filter.push(name);
            }
        }
        filter
    }

    /// Apply the scan-shape flags to a target built elsewhere.
    pub fn shape_target(&self, mut target: ScanTarget) -> ScanTarget {
        target.organization = target.organization || self.organization;
        target
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Simultaneous API requests within a collector tier.
    pub api_requests: usize,
    /// Simultaneous plugin executions.
    pub plugins: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            api_requests: 20,
            plugins: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Stream findings as CSV rows to this file.
    pub csv: Option<PathBuf>,
    /// Identifier of the scan, used as the batch output key. Generated when absent.
    pub scan_id: Option<String>,
    pub json: Option<JsonOutputSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonOutputSettings {
    /// Prepended to `<scan_id>.json`.
    #[serde(default)]
    pub prefix: String,
    pub store: StoreSettings,
}

/// Where the JSON batch is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSettings {
    Directory {
        path: PathBuf,
    },
    Http {
        endpoint: String,
        bucket: String,
        /// Environment variable holding a bearer token for the store.
        #[serde(default)]
        token_env: Option<String>,
    },
}

/// Load scan settings from a TOML file, or YAML when the extension says so.
pub fn load_settings(path: &Path) -> anyhow::Result<ScanSettings> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read settings file '{}': {}", path.display(), e))?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );

    let settings: ScanSettings = if is_yaml {
        serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings file '{}': {}", path.display(), e))?
    } else {
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings file '{}': {}", path.display(), e))?
    };

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = ScanSettings::default();
        assert_eq!(settings.cloud, "google");
        assert_eq!(settings.concurrency.plugins, 10);
        assert_eq!(settings.collect_options().max_in_flight, 20);
        assert_eq!(settings.partition(), RegionPartition::Standard);
    }

    #[test]
    fn test_load_toml_settings() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
plugin = "bucketAllUsersPolicy"
compliance = ["CIS", "pci", "cis"]
suppress = ["kmsKeyRotation:*:*"]
govcloud = true

[concurrency]
plugins = 4

[output]
csv = "findings.csv"

[output.json]
prefix = "scans/"

[output.json.store]
kind = "directory"
path = "out"
"#
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.plugin.as_deref(), Some("bucketAllUsersPolicy"));
        assert_eq!(settings.compliance_filter(), vec!["cis", "pci"]);
        assert_eq!(settings.concurrency.plugins, 4);
        assert_eq!(settings.concurrency.api_requests, 20);
        assert_eq!(settings.partition(), RegionPartition::GovCloud);

        let json = settings.output.json.unwrap();
        assert_eq!(json.prefix, "scans/");
        assert_eq!(json.store, StoreSettings::Directory { path: PathBuf::from("out") });
    }

    #[test]
    fn test_load_yaml_settings() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "ignore_ok: true\nskip_paginate: true\noutput:\n  json:\n    store:\n      kind: http\n      endpoint: https://storage.example\n      bucket: audits\n"
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert!(settings.ignore_ok);
        assert!(settings.collect_options().pagination_disabled);
        assert!(matches!(
            settings.output.json.unwrap().store,
            StoreSettings::Http { ref bucket, token_env: None, .. } if bucket == "audits"
        ));
    }

    #[test]
    fn test_invalid_settings_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "ignore_ok = \"maybe\"").unwrap();
        let err = load_settings(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings file"));
    }
}
