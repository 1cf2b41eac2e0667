//! Resource fan-out: binding dependent endpoints to upstream resources.

use super::result::{CallError, CollectionResult};
use crate::schema::EndpointSpec;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One request instance of a dependent endpoint.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Binding {
    pub location: String,
    pub resource: String,
    /// Property values keyed by placeholder, or why they could not be read.
    pub values: Result<HashMap<String, String>, CallError>,
}

/// Every instance a dependent endpoint must issue, plus the upstream
/// locations it has to report on even when they produced no resources.
#[derive(Debug, Clone, Default)]
pub(crate) struct DependentPlan {
    pub bindings: Vec<Binding>,
    /// Upstream location -> the upstream error when it yielded nothing.
    pub upstream_locations: BTreeMap<String, Option<CallError>>,
}

/// Bind `spec` to the resources its dependencies produced. Multiple
/// dependencies combine as a cartesian product; the first dependency decides
/// the location each instance is recorded under.
pub(crate) fn plan_dependent(spec: &EndpointSpec, collection: &CollectionResult) -> DependentPlan {
    let mut plan = DependentPlan::default();

    if let Some(first) = spec.depends_on.first() {
        for (location, result) in collection.call(first).into_iter().flatten() {
            let upstream_error = if result.records.is_empty() {
                result.error.clone()
            } else {
                None
            };
            plan.upstream_locations.insert(location.clone(), upstream_error);
        }
    }

    let sources: Vec<Vec<(&str, &Value)>> = spec
        .depends_on
        .iter()
        .map(|dependency| {
            collection
                .call(dependency)
                .into_iter()
                .flatten()
                .flat_map(|(location, result)| {
                    result.records.iter().map(move |record| (location.as_str(), record))
                })
                .collect()
        })
        .collect();

    for combination in cartesian(&sources) {
        let Some(&(location, _)) = combination.first() else {
            continue;
        };
        let unwrapped: Vec<&Value> = combination
            .iter()
            .filter_map(|(_, record)| unwrap_sub_object(record, &spec.sub_object))
            .collect();

        let mut values = HashMap::new();
        let mut missing = Vec::new();
        for property in &spec.properties {
            match unwrapped.iter().find_map(|record| property_value(record, property)) {
                Some(value) => {
                    values.insert(property.clone(), value);
                }
                None => missing.push(property.as_str()),
            }
        }

        let resource = spec
            .properties
            .iter()
            .map(|p| values.get(p).map_or("?", String::as_str))
            .collect::<Vec<_>>()
            .join("/");

        let values = if missing.is_empty() {
            Ok(values)
        } else {
            Err(CallError::new(format!(
                "upstream resource is missing propert{} {}",
                if missing.len() == 1 { "y" } else { "ies" },
                missing.join(", ")
            )))
        };

        plan.bindings.push(Binding {
            location: location.to_string(),
            resource,
            values,
        });
    }

    plan
}

fn cartesian<'a>(sources: &[Vec<(&'a str, &'a Value)>]) -> Vec<Vec<(&'a str, &'a Value)>> {
    if sources.is_empty() {
        return Vec::new();
    }
    let mut combinations: Vec<Vec<(&str, &Value)>> = vec![Vec::new()];
    for source in sources {
        combinations = combinations
            .iter()
            .flat_map(|prefix| {
                source.iter().map(move |item| {
                    let mut next = prefix.clone();
                    next.push(*item);
                    next
                })
            })
            .collect();
    }
    combinations
}

pub(crate) fn unwrap_sub_object<'a>(record: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(record, |value, key| value.get(key))
}

/// Scalar field rendered for URL substitution.
pub(crate) fn property_value(record: &Value, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Substitute `{token}` placeholders. Returns the first unbound token on failure.
pub(crate) fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            rendered.push_str(&rest[start..]);
            return Ok(rendered);
        };
        let token = &after[..end];
        let value = vars.get(token).ok_or_else(|| token.to_string())?;
        rendered.push_str(value);
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}
