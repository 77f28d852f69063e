//! Router for matching edge requests to logical services

use discovery_api::{ServiceName, ValidationError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One entry of the gateway's route table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Exact path, `/prefix/` or `/prefix/*`
    pub path: String,
    pub service: String,
    /// Allowed methods; empty allows all
    #[serde(default)]
    pub methods: Vec<String>,
    /// Remove the matched prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Where a matched request goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    pub service: ServiceName,
    /// Path and query to send upstream
    pub upstream_path: String,
}

#[derive(Debug)]
struct CompiledRule {
    rule: RouteRule,
    service: ServiceName,
}

/// Router for matching HTTP requests to services
#[derive(Debug, Default)]
pub struct Router {
    rules: Vec<CompiledRule>,
}

impl Router {
    /// Build a router; every rule must name a valid service
    pub fn new(rules: Vec<RouteRule>) -> Result<Self, ValidationError> {
        let mut rules = rules
            .into_iter()
            .map(|rule| {
                let service = ServiceName::new(rule.service.clone())?;
                Ok(CompiledRule { rule, service })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        // Most specific pattern first
        rules.sort_by(|a, b| b.rule.path.len().cmp(&a.rule.path.len()));
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Find the route for `path_and_query`
    pub fn route(&self, method: &str, path_and_query: &str) -> Option<RouteMatch> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let compiled = self.rules.iter().find(|c| {
            self.match_path(path, &c.rule.path) && self.match_method(method, &c.rule.methods)
        })?;

        let mut upstream_path = if compiled.rule.strip_prefix {
            strip(path, &compiled.rule.path)
        } else {
            path.to_string()
        };
        if let Some(query) = query {
            upstream_path.push('?');
            upstream_path.push_str(query);
        }

        debug!(path, service = %compiled.service, upstream = %upstream_path, "Route matched");
        Some(RouteMatch {
            service: compiled.service.clone(),
            upstream_path,
        })
    }

    /// Match a request path against route patterns
    pub fn match_path(&self, path: &str, pattern: &str) -> bool {
        if pattern == path {
            return true;
        }

        if pattern.ends_with('/') && path.starts_with(pattern) {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return path == prefix || path.starts_with(&format!("{}/", prefix));
        }

        false
    }

    /// Match HTTP method against allowed methods
    pub fn match_method(&self, method: &str, allowed_methods: &[String]) -> bool {
        if allowed_methods.is_empty() {
            return true;
        }

        allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

fn strip(path: &str, pattern: &str) -> String {
    let prefix = pattern
        .strip_suffix("/*")
        .or_else(|| pattern.strip_suffix('/'))
        .unwrap_or(pattern);
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}
