//! Scope filtering
//!
//! Decides whether traffic for a host should be recorded. Patterns are exact
//! hostnames or `*.suffix` wildcards; exclusions always beat inclusions.

use serde::{Deserialize, Serialize};

/// Include/exclude pattern lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeRules {
    pub in_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
}

impl ScopeRules {
    pub fn new<I, O, S>(in_scope: I, out_of_scope: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            in_scope: in_scope.into_iter().map(Into::into).collect(),
            out_of_scope: out_of_scope.into_iter().map(Into::into).collect(),
        }
    }

    /// True when neither list holds a non-blank pattern
    pub fn is_empty(&self) -> bool {
        self.in_scope
            .iter()
            .chain(self.out_of_scope.iter())
            .all(|p| p.trim().is_empty())
    }
}

/// Whether `host` should be recorded under `rules`
///
/// No rules (or only blank patterns) means everything is in scope.
pub fn is_in_scope(host: &str, rules: Option<&ScopeRules>) -> bool {
    let rules = match rules {
        Some(rules) if !rules.is_empty() => rules,
        _ => return true,
    };

    let host = normalize(host);

    if rules.out_of_scope.iter().any(|p| matches_pattern(&host, p)) {
        return false;
    }

    rules.in_scope.iter().any(|p| matches_pattern(&host, p))
}

/// Match a normalized host against one pattern
pub fn matches_pattern(host: &str, pattern: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern.is_empty() {
        return false;
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) if !suffix.is_empty() => {
            host == suffix
                || (host.len() > suffix.len()
                    && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        }
        _ => host == pattern,
    }
}

fn normalize(value: &str) -> String {
    value.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rules_means_everything_in_scope() {
        assert!(is_in_scope("example.com", None));
        assert!(is_in_scope("example.com", Some(&ScopeRules::default())));
        assert!(is_in_scope(
            "example.com",
            Some(&ScopeRules::new([""], ["  "]))
        ));
    }

    #[test]
    fn test_exact_match() {
        let rules = ScopeRules::new(["example.com"], Vec::<&str>::new());
        assert!(is_in_scope("example.com", Some(&rules)));
        assert!(is_in_scope("Example.COM.", Some(&rules)));
        assert!(!is_in_scope("www.example.com", Some(&rules)));
    }

    #[test]
    fn test_wildcard_matches_subdomains_and_apex() {
        assert!(matches_pattern("api.example.com", "*.example.com"));
        assert!(matches_pattern("a.b.example.com", "*.example.com"));
        assert!(matches_pattern("example.com", "*.example.com"));
        assert!(!matches_pattern("badexample.com", "*.example.com"));
        assert!(!matches_pattern("example.org", "*.example.com"));
        assert!(!matches_pattern("anything", "*."));
    }

    #[test]
    fn test_unmatched_host_is_out_of_scope() {
        let rules = ScopeRules::new(["*.example.com"], Vec::<&str>::new());
        assert!(!is_in_scope("other.org", Some(&rules)));
    }

    #[test]
    fn test_exclusion_wins_regardless_of_order() {
        let rules = ScopeRules::new(["*.example.com"], ["admin.example.com"]);
        assert!(is_in_scope("www.example.com", Some(&rules)));
        assert!(!is_in_scope("admin.example.com", Some(&rules)));

        let broad_exclusion = ScopeRules::new(["admin.example.com"], ["*.example.com"]);
        assert!(!is_in_scope("admin.example.com", Some(&broad_exclusion)));
    }

    #[test]
    fn test_exclusion_only_rules() {
        let rules = ScopeRules::new(Vec::<&str>::new(), ["admin.example.com"]);
        assert!(!is_in_scope("admin.example.com", Some(&rules)));
        assert!(!is_in_scope("www.example.com", Some(&rules)));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let rules: ScopeRules =
            serde_json::from_str(r#"{"inScope":["a.test"],"outOfScope":["b.test"]}"#).unwrap();
        assert_eq!(rules.in_scope, vec!["a.test"]);
        assert_eq!(rules.out_of_scope, vec!["b.test"]);
    }
}
