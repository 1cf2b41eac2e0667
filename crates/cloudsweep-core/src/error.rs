use crate::collector::CollectError;
use crate::schema::CallGraphError;
use crate::suppress::SuppressError;
use thiserror::Error;

/// Conditions that stop a scan before it reports anything.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Suppression(#[from] SuppressError),

    #[error(transparent)]
    CallGraph(#[from] CallGraphError),

    #[error("nothing to collect: {skipped} plugin(s) skipped and no eligible plugin requires an endpoint")]
    NothingToCollect { skipped: usize },

    #[error("unknown plugin '{name}'{}", suggestion_suffix(.suggestion))]
    UnknownPlugin {
        name: String,
        suggestion: Option<String>,
    },

    #[error("unknown cloud provider '{0}'")]
    UnknownProvider(String),

    #[error("unable to obtain API metadata: {0}")]
    Collection(#[from] CollectError),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean '{}'?)", name),
        None => String::new(),
    }
}
