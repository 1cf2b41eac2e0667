//! Built-in rule checks.

pub mod google;

use crate::collector::{CallResult, CollectionResult};
use crate::plugin::PluginError;
use crate::schema::EndpointId;

/// Results of a required endpoint, or `MissingData` when it was never collected.
pub(crate) fn required_call<'a>(
    collection: &'a CollectionResult,
    endpoint: &str,
) -> Result<&'a CallResult, PluginError> {
    let id: EndpointId = endpoint
        .parse()
        .map_err(|e| PluginError::Failed(format!("bad endpoint id '{endpoint}': {e}")))?;
    collection.call(&id).ok_or(PluginError::MissingData(id))
}
