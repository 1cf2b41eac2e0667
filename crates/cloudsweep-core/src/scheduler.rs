//! Bounded-concurrency plugin execution and the per-finding pipeline.

use crate::collector::CollectionResult;
use crate::config::ScanSettings;
use crate::output::{OutputMultiplexer, OutputSummary, ResultRecord};
use crate::plugin::{Finding, Plugin, PluginError, ScanPlan, Severity, SkippedPlugin, Status};
use crate::suppress::{suppression_key, SuppressionFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PLUGIN_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFailure {
    pub id: String,
    pub error: String,
}

/// Result of one completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub scan_id: String,
    /// Worst status among non-suppressed findings.
    pub max_severity: Severity,
    pub findings_reported: usize,
    pub findings_suppressed: usize,
    /// Reported findings whose status was out of range. Not part of `max_severity`.
    pub unknown_findings: usize,
    pub skipped_plugins: Vec<SkippedPlugin>,
    pub failed_plugins: Vec<PluginFailure>,
    /// Plugins that completed without a single finding.
    pub empty_plugins: Vec<String>,
    pub output: OutputSummary,
}

impl ScanOutcome {
    pub fn exit_code(&self) -> i32 {
        i32::from(self.max_severity.code())
    }
}

/// Runs eligible plugins against a finished collection.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_concurrent: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_PLUGIN_CONCURRENCY)
    }
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execute every eligible plugin of `plan`, feed surviving findings to
    /// `output`, and close it once all plugins have settled.
    pub async fn run(
        &self,
        collection: Arc<CollectionResult>,
        plan: ScanPlan,
        settings: Arc<ScanSettings>,
        suppression: &SuppressionFilter,
        mut output: OutputMultiplexer,
        scan_id: &str,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome {
            scan_id: scan_id.to_string(),
            skipped_plugins: plan.skipped,
            ..ScanOutcome::default()
        };
        let compliance = settings.compliance_filter();
        let gate = Arc::new(Semaphore::new(self.max_concurrent));

        info!(
            plugins = plan.eligible.len(),
            skipped = outcome.skipped_plugins.len(),
            max_concurrent = self.max_concurrent,
            "running plugins"
        );

        let mut set = JoinSet::new();
        let mut task_plugins = HashMap::new();
        for plugin in plan.eligible {
            let id = plugin.meta().id.clone();
            let collection = Arc::clone(&collection);
            let settings = Arc::clone(&settings);
            let gate = Arc::clone(&gate);

            let handle = set.spawn(async move {
                let result = match gate.acquire_owned().await {
                    Ok(_permit) => {
                        debug!(plugin = %plugin.meta().id, "plugin started");
                        plugin.run(&collection, &settings).await
                    }
                    Err(_) => Err(PluginError::Failed("plugin gate closed".to_string())),
                };
                (plugin, result)
            });
            task_plugins.insert(handle.id(), id);
        }

        while let Some(joined) = set.join_next().await {
            let (plugin, result) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    let id = task_plugins
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    let error = PluginError::Panicked(join_error.to_string());
                    error!(plugin = %id, %error, "plugin task aborted");
                    outcome.failed_plugins.push(PluginFailure {
                        id,
                        error: error.to_string(),
                    });
                    continue;
                }
            };

            match result {
                Ok(findings) if findings.is_empty() => {
                    warn!(
                        plugin = %plugin.meta().id,
                        title = %plugin.meta().title,
                        "plugin returned no results; there may be a problem with this plugin"
                    );
                    outcome.empty_plugins.push(plugin.meta().id.clone());
                }
                Ok(findings) => {
                    debug!(plugin = %plugin.meta().id, findings = findings.len(), "plugin finished");
                    for finding in findings {
                        report(
                            plugin.as_ref(),
                            finding,
                            suppression,
                            &compliance,
                            &mut output,
                            &mut outcome,
                        )
                        .await;
                    }
                }
                Err(error) => {
                    error!(plugin = %plugin.meta().id, %error, "plugin failed");
                    outcome.failed_plugins.push(PluginFailure {
                        id: plugin.meta().id.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        outcome.output = output.close(scan_id).await;
        outcome.failed_plugins.sort_by(|a, b| a.id.cmp(&b.id));
        outcome.empty_plugins.sort();

        info!(
            severity = outcome.max_severity.symbol(),
            reported = outcome.findings_reported,
            suppressed = outcome.findings_suppressed,
            failed = outcome.failed_plugins.len(),
            "scan finished"
        );
        outcome
    }
}

/// Suppress, label, forward, then fold one finding.
async fn report(
    plugin: &dyn Plugin,
    finding: Finding,
    suppression: &SuppressionFilter,
    compliance: &[String],
    output: &mut OutputMultiplexer,
    outcome: &mut ScanOutcome,
) {
    let meta = plugin.meta();
    let key = suppression_key(&meta.id, finding.region.as_deref(), finding.resource.as_deref());
    if suppression.matches(&key) {
        debug!(%key, "finding suppressed");
        outcome.findings_suppressed += 1;
        return;
    }

    let label = meta.compliance_label(compliance);
    output.write_result(&ResultRecord::new(&finding, meta, label)).await;

    outcome.findings_reported += 1;
    if finding.status == Status::Unknown {
        outcome.unknown_findings += 1;
    }
    outcome.max_severity = outcome.max_severity.fold(finding.status);
}
