use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SuppressError {
    #[error("suppression rule '{0}' must have the form pluginId:region:resource")]
    Malformed(String),

    #[error("suppression rule '{rule}' does not compile: {message}")]
    Pattern { rule: String, message: String },
}

#[derive(Debug, Clone)]
enum Segment {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl Segment {
    fn compile(raw: &str, rule: &str) -> Result<Self, SuppressError> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(Segment::Any);
        }
        if !raw.contains('*') {
            return Ok(Segment::Exact(raw.to_string()));
        }

        let pattern = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Regex::new(&format!("^{pattern}$"))
            .map(Segment::Pattern)
            .map_err(|e| SuppressError::Pattern {
                rule: rule.to_string(),
                message: e.to_string(),
            })
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(expected) => expected == value,
            Segment::Pattern(re) => re.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    plugin: Segment,
    region: Segment,
    resource: Segment,
}

/// Compiled suppression rules. Any matching rule suppresses a finding.
#[derive(Debug, Clone, Default)]
pub struct SuppressionFilter {
    rules: Vec<Rule>,
}

impl SuppressionFilter {
    pub fn compile(rules: &[String]) -> Result<Self, SuppressError> {
        let rules = rules
            .iter()
            .filter(|rule| !rule.trim().is_empty())
            .map(|rule| {
                let mut parts = rule.splitn(3, ':');
                let (Some(plugin), Some(region), Some(resource)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(SuppressError::Malformed(rule.clone()));
                };
                Ok(Rule {
                    plugin: Segment::compile(plugin, rule)?,
                    region: Segment::compile(region, rule)?,
                    resource: Segment::compile(resource, rule)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Test a `pluginId:region:resource` key.
    pub fn matches(&self, key: &str) -> bool {
        let mut parts = key.splitn(3, ':');
        let plugin = parts.next().unwrap_or_default();
        let region = parts.next().unwrap_or_default();
        let resource = parts.next().unwrap_or_default();
        self.matches_parts(plugin, region, resource)
    }

    pub fn matches_parts(&self, plugin: &str, region: &str, resource: &str) -> bool {
        self.rules.iter().any(|rule| {
            rule.plugin.matches(plugin) && rule.region.matches(region) && rule.resource.matches(resource)
        })
    }
}

/// Key a finding is tested under; missing or empty parts become `any`.
pub fn suppression_key(plugin_id: &str, region: Option<&str>, resource: Option<&str>) -> String {
    let or_any = |part: Option<&str>| part.filter(|p| !p.is_empty()).unwrap_or("any").to_string();
    format!("{}:{}:{}", plugin_id, or_any(region), or_any(resource))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rules: &[&str]) -> SuppressionFilter {
        SuppressionFilter::compile(&rules.iter().map(|r| r.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_wildcard_segments() {
        let f = filter(&["bucketAllUsersPolicy:*:*"]);
        assert!(f.matches("bucketAllUsersPolicy:global:logs-bucket"));
        assert!(f.matches("bucketAllUsersPolicy:any:any"));
        assert!(!f.matches("openSsh:global:default-allow-ssh"));
    }

    #[test]
    fn test_empty_segment_matches_anything() {
        let f = filter(&["openSsh::"]);
        assert!(f.matches("openSsh:us-east1:fw-1"));
    }

    #[test]
    fn test_partial_wildcards_and_colons_in_resource() {
        let f = filter(&["*:us-*:projects/p/locations/us-east1/keyRings/r:k*"]);
        assert!(f.matches("kmsKeyRotation:us-east1:projects/p/locations/us-east1/keyRings/r:key-1"));
        assert!(!f.matches("kmsKeyRotation:europe-west1:projects/p/locations/us-east1/keyRings/r:key-1"));
        assert!(!f.matches("kmsKeyRotation:us-east1:projects/p/locations/us-east1/keyRings/r:other"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let f = filter(&["p:global:bucket.name*"]);
        assert!(f.matches("p:global:bucket.name-1"));
        assert!(!f.matches("p:global:bucketXname-1"));
    }

    #[test]
    fn test_malformed_rule_rejected() {
        let err = SuppressionFilter::compile(&["onlyplugin:region".to_string()]).unwrap_err();
        assert_eq!(err, SuppressError::Malformed("onlyplugin:region".to_string()));
    }

    #[test]
    fn test_no_rules_match_nothing() {
        let f = SuppressionFilter::default();
        assert!(f.is_empty());
        assert!(!f.matches("p:any:any"));
    }

    #[test]
    fn test_suppression_key_defaults() {
        assert_eq!(suppression_key("p", None, None), "p:any:any");
        assert_eq!(suppression_key("p", Some("us-east1"), Some("vm")), "p:us-east1:vm");
        assert_eq!(suppression_key("p", Some(""), Some("vm")), "p:any:vm");
    }
}
