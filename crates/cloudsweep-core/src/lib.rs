pub mod checks;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod plugin;
pub mod provider;
pub mod scheduler;
pub mod schema;
pub mod suppress;

pub use collector::{CollectOptions, CollectionResult, Collector, FixtureTransport, HttpTransport, ScanTarget};
pub use config::{load_settings, ScanSettings};
pub use engine::Engine;
pub use error::ScanError;
pub use output::{OutputMultiplexer, OutputSink, ResultRecord};
pub use plugin::{Finding, Plugin, PluginMeta, PluginRegistry, Severity, Status};
pub use provider::{Provider, ProviderRegistry};
pub use scheduler::{ScanOutcome, Scheduler};
pub use schema::{CallGraph, EndpointId, Tier};
pub use suppress::SuppressionFilter;
