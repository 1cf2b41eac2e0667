use async_trait::async_trait;
use cloudsweep_core::output::OutputError;
use cloudsweep_core::plugin::Status;
use cloudsweep_core::schema::{LocationScope, Tier};
use cloudsweep_core::{CallGraph, OutputSink, Provider, ResultRecord, ScanOutcome, Severity};
use colored::*;

/// Prints each reported finding to stdout as it arrives.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    printed: usize,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn write_result(&mut self, record: &ResultRecord) -> Result<(), OutputError> {
        if self.printed == 0 {
            println!();
        }
        print_record(record);
        self.printed += 1;
        Ok(())
    }

    async fn close(&mut self, _scan_id: &str) -> Result<(), OutputError> {
        Ok(())
    }
}

fn status_tag(status: Status) -> String {
    let tag = format!(" {} ", status.symbol());
    match status {
        Status::Ok => tag.on_green().black().bold().to_string(),
        Status::Warn => tag.on_yellow().black().bold().to_string(),
        Status::Fail => tag.on_red().white().bold().to_string(),
        Status::Unknown => tag.dimmed().to_string(),
    }
}

fn print_record(record: &ResultRecord) {
    println!(
        " {} [{}] {}",
        status_tag(record.status),
        record.plugin.dimmed(),
        record.title.bold()
    );
    println!(
        "   {} {} {}",
        "|".dimmed(),
        record.region.cyan(),
        record.resource
    );
    println!("   {} {}", "|".dimmed(), record.message);
    if let Some(compliance) = &record.compliance {
        println!("   {} {}", "|".dimmed(), compliance.dimmed());
    }
}

fn severity_word(severity: Severity) -> String {
    match severity {
        Severity::Ok => severity.symbol().green().bold().to_string(),
        Severity::Warn => severity.symbol().yellow().bold().to_string(),
        Severity::Fail => severity.symbol().red().bold().to_string(),
    }
}

/// Print the end-of-scan summary.
pub fn print_scan_summary(outcome: &ScanOutcome) {
    println!();
    println!("{}", format!(" cloudsweep scan {}", outcome.scan_id).bold());
    println!(" {}", "=".repeat(60).dimmed());

    println!(
        " Result: {} ({} reported, {} suppressed, {} unknown)",
        severity_word(outcome.max_severity),
        outcome.findings_reported,
        outcome.findings_suppressed,
        outcome.unknown_findings,
    );
    println!(
        " {} Delivered: {} | OK dropped: {} | Sink errors: {}",
        "|-".dimmed(),
        outcome.output.delivered,
        outcome.output.ignored_ok,
        outcome.output.failures,
    );

    if !outcome.skipped_plugins.is_empty() {
        println!();
        println!(" {}", "Skipped".bold().underline());
        for skipped in &outcome.skipped_plugins {
            println!(
                " {} {} ({})",
                "|-".dimmed(),
                skipped.id,
                skipped.reason.to_string().dimmed()
            );
        }
    }

    if !outcome.empty_plugins.is_empty() {
        println!();
        println!(" {}", "No results".bold().underline());
        for id in &outcome.empty_plugins {
            println!(" {} {}", "|-".dimmed(), id.yellow());
        }
    }

    if !outcome.failed_plugins.is_empty() {
        println!();
        println!(" {}", "Failed".bold().underline());
        for failure in &outcome.failed_plugins {
            println!(
                " {} {}: {}",
                "|-".dimmed(),
                failure.id.red(),
                failure.error
            );
        }
    }
    println!();
}

/// List a provider's checks with the endpoints they read.
pub fn print_plugins(provider: &Provider) {
    println!();
    println!(
        "{}",
        format!(
            " cloudsweep checks for '{}' ({})",
            provider.id,
            provider.plugins.len()
        )
        .bold()
    );
    println!();

    for plugin in provider.plugins.iter() {
        let meta = plugin.meta();
        println!(
            " {} {} {}",
            meta.id.bold(),
            "-".dimmed(),
            meta.title
        );
        println!("   {} Category: {}", "|".dimmed(), meta.category);
        let endpoints = meta
            .required_endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("   {} Reads: {}", "|".dimmed(), endpoints.cyan());
        if !meta.compliance.is_empty() {
            let frameworks = meta
                .compliance
                .keys()
                .map(|name| name.to_uppercase())
                .collect::<Vec<_>>()
                .join(", ");
            println!("   {} Compliance: {}", "|".dimmed(), frameworks);
        }
        if !meta.recommended_action.is_empty() {
            println!("   {} {}", "|".dimmed(), meta.recommended_action.dimmed());
        }
    }
    println!();
}

/// Show the call graph tier by tier.
pub fn print_endpoints(graph: &CallGraph) {
    println!();
    println!(
        "{}",
        format!(" cloudsweep call graph ({} endpoints)", graph.len()).bold()
    );

    for tier in Tier::ALL {
        let endpoints = graph.in_tier(tier);
        if endpoints.is_empty() {
            continue;
        }
        println!();
        println!(
            " {} ({})",
            tier.label().to_uppercase().bold().underline(),
            endpoints.len()
        );
        for spec in endpoints {
            let scope = match spec.scope {
                LocationScope::Global => String::new(),
                LocationScope::Region => " [region]".cyan().to_string(),
                LocationScope::Zone => " [zone]".cyan().to_string(),
            };
            let paged = if spec.paging.is_some() {
                " paged".dimmed().to_string()
            } else {
                String::new()
            };
            println!(
                " {} {} {}{}{}",
                "|-".dimmed(),
                spec.id.to_string().bold(),
                spec.method.as_str().dimmed(),
                scope,
                paged
            );
            if !spec.depends_on.is_empty() {
                let upstream = spec
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("   {} after {}", "|".dimmed(), upstream);
            }
        }
    }
    println!();
}
