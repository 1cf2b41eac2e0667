use crate::collector::{ApiTransport, CollectionResult, Collector, ScanTarget};
use crate::config::ScanSettings;
use crate::error::ScanError;
use crate::output::OutputMultiplexer;
use crate::plugin::{select_plugins, ScanPlan};
use crate::provider::Provider;
use crate::scheduler::{ScanOutcome, Scheduler};
use crate::suppress::SuppressionFilter;
use std::sync::Arc;
use tracing::{info, warn};

/// Drives one provider's scans: plugin selection, collection and scheduling.
#[derive(Debug, Clone)]
pub struct Engine {
    provider: Provider,
}

impl Engine {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Plugins that would run for `target` under `settings`.
    pub fn plan(&self, target: &ScanTarget, settings: &ScanSettings) -> Result<ScanPlan, ScanError> {
        let plan = select_plugins(
            &self.provider.plugins,
            settings,
            target,
            self.provider.applicability,
        )?;
        for skipped in &plan.skipped {
            info!(plugin = %skipped.id, reason = %skipped.reason, "skipping plugin");
        }
        Ok(plan)
    }

    pub async fn scan(
        &self,
        target: &ScanTarget,
        settings: &ScanSettings,
        output: OutputMultiplexer,
        transport: Arc<dyn ApiTransport>,
    ) -> Result<ScanOutcome, ScanError> {
        self.scan_with_collection(target, settings, output, transport)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Run a scan and also hand back the collection the plugins saw.
    pub async fn scan_with_collection(
        &self,
        target: &ScanTarget,
        settings: &ScanSettings,
        output: OutputMultiplexer,
        transport: Arc<dyn ApiTransport>,
    ) -> Result<(ScanOutcome, Arc<CollectionResult>), ScanError> {
        let suppression = SuppressionFilter::compile(&settings.suppress)?;
        let scan_id = match &settings.output.scan_id {
            Some(id) => {
                check_scan_id(id)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let target = settings.shape_target(target.clone());

        let plan = self.plan(&target, settings)?;
        let required = plan.required_endpoints();
        if required.is_empty() {
            return Err(ScanError::NothingToCollect {
                skipped: plan.skipped.len(),
            });
        }

        info!(
            provider = %self.provider.id,
            project = %target.project_id,
            plugins = plan.eligible.len(),
            endpoints = required.len(),
            "starting scan"
        );

        let collector = Collector::new(
            Arc::clone(&self.provider.call_graph),
            transport,
            settings.collect_options(),
        );
        let collection = Arc::new(collector.collect(&target, &required).await?);
        if collection.is_empty() {
            warn!("collection returned no data");
        }

        let outcome = Scheduler::new(settings.concurrency.plugins)
            .run(
                Arc::clone(&collection),
                plan,
                Arc::new(settings.clone()),
                &suppression,
                output,
                &scan_id,
            )
            .await;

        Ok((outcome, collection))
    }
}

/// Scan ids name batch output objects, so they must stay a single path segment.
fn check_scan_id(id: &str) -> Result<(), ScanError> {
    if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\']) {
        return Err(ScanError::Configuration(format!(
            "scan id '{}' must be a single name without path separators",
            id
        )));
    }
    Ok(())
}
