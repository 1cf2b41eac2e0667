mod display;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use cloudsweep_core::collector::ApiTransport;
use cloudsweep_core::config::{JsonOutputSettings, StoreSettings};
use cloudsweep_core::{
    load_settings, Engine, FixtureTransport, HttpTransport, OutputMultiplexer, ProviderRegistry,
    ScanSettings, ScanTarget,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cloudsweep",
    version,
    about = "cloudsweep - cloud account security auditor",
    long_about = "Collect configuration from a cloud account's APIs, run security and compliance checks against it, and report every finding.\n\nExit status reflects the worst finding when --exit-code is given: 0 OK, 1 WARN, 2 FAIL."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect account data and run the checks against it
    Scan(ScanArgs),

    /// List the checks available for a cloud
    Plugins {
        /// Cloud provider
        #[arg(long, default_value = "google")]
        cloud: String,
    },

    /// Show the API call graph, tier by tier
    Endpoints {
        /// Cloud provider
        #[arg(long, default_value = "google")]
        cloud: String,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct ScanArgs {
    /// Settings file (TOML, or YAML by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cloud provider (overrides the settings file)
    #[arg(long)]
    cloud: Option<String>,

    /// Project to audit
    #[arg(long, env = "CLOUDSDK_CORE_PROJECT")]
    project: Option<String>,

    /// Organization the project belongs to
    #[arg(long)]
    organization_id: Option<String>,

    /// Environment variable holding the OAuth access token
    #[arg(long, default_value = "GOOGLE_OAUTH_ACCESS_TOKEN")]
    token_env: String,

    /// Run a single check
    #[arg(long)]
    plugin: Option<String>,

    /// Only run checks mapped to this framework (repeatable)
    #[arg(long)]
    compliance: Vec<String>,

    /// Suppress findings matching pluginId:region:resource (repeatable, * wildcards)
    #[arg(long)]
    suppress: Vec<String>,

    /// Write findings as CSV
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write the JSON batch into this directory on completion
    #[arg(long)]
    json_dir: Option<PathBuf>,

    /// Scan identifier used to name batch output
    #[arg(long)]
    scan_id: Option<String>,

    /// Drop OK findings from every output
    #[arg(long)]
    ignore_ok: bool,

    /// Fetch only the first page of paginated listings
    #[arg(long)]
    skip_paginate: bool,

    /// Restrict regions to the government partition
    #[arg(long, conflicts_with = "china")]
    govcloud: bool,

    /// Restrict regions to the China partition
    #[arg(long)]
    china: bool,

    /// Treat the target as an organization rather than a single project
    #[arg(long)]
    organization: bool,

    /// Exit with the worst finding's status code
    #[arg(long)]
    exit_code: bool,

    /// Save the collected API data as JSON
    #[arg(long)]
    dump_collection: Option<PathBuf>,

    /// Replay recorded API responses instead of calling the provider
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Print only the summary
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Scan(args) => cmd_scan(args).await,
        Commands::Plugins { cloud } => cmd_plugins(&cloud),
        Commands::Endpoints { cloud } => cmd_endpoints(&cloud),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "cloudsweep",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Settings file first, then command-line flags on top.
fn resolve_settings(args: &ScanArgs) -> Result<ScanSettings> {
    let mut settings = match &args.config {
        Some(path) => load_settings(path)?,
        None => ScanSettings::default(),
    };

    if let Some(cloud) = &args.cloud {
        settings.cloud = cloud.clone();
    }
    if args.plugin.is_some() {
        settings.plugin = args.plugin.clone();
    }
    settings.compliance.extend(args.compliance.iter().cloned());
    settings.suppress.extend(args.suppress.iter().cloned());
    settings.ignore_ok |= args.ignore_ok;
    settings.skip_paginate |= args.skip_paginate;
    settings.organization |= args.organization;
    if args.govcloud || args.china {
        settings.govcloud = args.govcloud;
        settings.china = args.china;
    }
    if settings.govcloud && settings.china {
        anyhow::bail!("govcloud and china partitions are mutually exclusive");
    }

    if args.csv.is_some() {
        settings.output.csv = args.csv.clone();
    }
    if args.scan_id.is_some() {
        settings.output.scan_id = args.scan_id.clone();
    }
    if let Some(dir) = &args.json_dir {
        settings.output.json = Some(JsonOutputSettings {
            prefix: String::new(),
            store: StoreSettings::Directory { path: dir.clone() },
        });
    }

    Ok(settings)
}

async fn cmd_scan(args: ScanArgs) -> Result<()> {
    let settings = resolve_settings(&args)?;

    let Some(project_id) = args.project.clone() else {
        anyhow::bail!("No project given. Pass --project or set CLOUDSDK_CORE_PROJECT.");
    };
    let target = ScanTarget {
        project_id,
        organization_id: args.organization_id.clone(),
        access_token: std::env::var(&args.token_env).ok(),
        organization: settings.organization,
    };

    let transport: Arc<dyn ApiTransport> = match &args.fixtures {
        Some(path) => {
            info!(fixtures = %path.display(), "replaying recorded responses");
            Arc::new(FixtureTransport::load(path)?)
        }
        None => {
            if target.access_token.is_none() {
                anyhow::bail!(
                    "No access token found in ${}. Export one (e.g. `gcloud auth print-access-token`) or use --fixtures.",
                    args.token_env
                );
            }
            Arc::new(HttpTransport::new(
                target.access_token.as_deref(),
                Duration::from_secs(settings.http.timeout_secs),
            )?)
        }
    };

    let providers = ProviderRegistry::builtin()?;
    let engine = Engine::new(providers.get(&settings.cloud)?.clone());

    let mut output = OutputMultiplexer::from_settings(&settings)?;
    if !args.quiet {
        output.add_sink(Box::new(display::ConsoleSink::new()));
    }

    let (outcome, collection) = engine
        .scan_with_collection(&target, &settings, output, transport)
        .await?;

    if let Some(path) = &args.dump_collection {
        write_collection(path, &serde_json::to_string_pretty(collection.as_ref())?)?;
    }

    display::print_scan_summary(&outcome);

    if args.exit_code {
        std::process::exit(outcome.exit_code());
    }
    Ok(())
}

fn write_collection(path: &Path, json: &str) -> Result<()> {
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write collection to {}", path.display()))?;
    info!(path = %path.display(), "collection saved");
    Ok(())
}

fn cmd_plugins(cloud: &str) -> Result<()> {
    let providers = ProviderRegistry::builtin()?;
    display::print_plugins(providers.get(cloud)?);
    Ok(())
}

fn cmd_endpoints(cloud: &str) -> Result<()> {
    let providers = ProviderRegistry::builtin()?;
    display::print_endpoints(&providers.get(cloud)?.call_graph);
    Ok(())
}
