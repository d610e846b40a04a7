//! Condition routing rules
//!
//! A rule reads `condition => consequence`. Each side is a conjunction of
//! `key=v1,v2` or `key!=v1,v2` matchers joined by `&`, values may use `*`
//! anywhere as a wildcard. When the consumer satisfies the condition only
//! providers satisfying the consequence survive.

use crate::{ClusterError, Result};
use std::fmt;
use tracing::{debug, warn};
use traffic_core::endpoint::{FORCE_KEY, METHOD_KEY, RULE_KEY};
use traffic_core::Endpoint;

const ARROW: &str = "=>";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Pattern {
    Any,
    Exact(String),
    /// Literal pieces between `*` wildcards, first anchored at the start, last at the end
    Glob(Vec<String>),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        if raw.chars().all(|c| c == '*') {
            Pattern::Any
        } else if raw.contains('*') {
            Pattern::Glob(raw.split('*').map(str::to_string).collect())
        } else {
            Pattern::Exact(raw.to_string())
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(exact) => value == exact,
            Pattern::Glob(pieces) => glob_matches(pieces, value),
        }
    }
}

fn glob_matches(pieces: &[String], value: &str) -> bool {
    let Some((first, rest)) = pieces.split_first() else {
        return true;
    };
    let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for piece in middle {
        match remaining.find(piece.as_str()) {
            Some(at) => remaining = &remaining[at + piece.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.as_str())
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Matcher {
    key: String,
    negated: bool,
    patterns: Vec<Pattern>,
}

impl Matcher {
    fn parse(rule: &str, raw: &str) -> Result<Self> {
        let (key, values, negated) = match raw.split_once("!=") {
            Some((key, values)) => (key, values, true),
            None => match raw.split_once('=') {
                Some((key, values)) => (key, values, false),
                None => {
                    return Err(invalid_rule(rule, format!("matcher {:?} has no operator", raw)))
                }
            },
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(invalid_rule(rule, format!("matcher {:?} has an empty key", raw)));
        }
        if values.contains('=') {
            return Err(invalid_rule(rule, format!("matcher {:?} has a dangling operator", raw)));
        }
        let patterns: Vec<Pattern> = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Pattern::parse)
            .collect();
        if patterns.is_empty() {
            return Err(invalid_rule(rule, format!("matcher {:?} has no values", raw)));
        }

        Ok(Self {
            key: key.to_string(),
            negated,
            patterns,
        })
    }

    fn matches(&self, endpoint: &Endpoint) -> bool {
        let value = attribute(endpoint, &self.key);
        match (value, self.negated) {
            (Some(value), false) => self.patterns.iter().any(|p| p.matches(&value)),
            (Some(value), true) => !self.patterns.iter().any(|p| p.matches(&value)),
            (None, false) => false,
            (None, true) => true,
        }
    }
}

fn attribute(endpoint: &Endpoint, key: &str) -> Option<String> {
    match key {
        "host" => Some(endpoint.host().to_string()),
        "port" => Some(endpoint.port().to_string()),
        "protocol" => Some(endpoint.protocol().to_string()),
        "address" => Some(endpoint.address()),
        "path" | "interface" => Some(endpoint.service_interface().to_string()),
        "method" => endpoint.param(METHOD_KEY).map(str::to_string),
        other => endpoint.param(other).map(str::to_string),
    }
}

fn invalid_rule(rule: &str, reason: impl fmt::Display) -> ClusterError {
    ClusterError::Configuration(format!("invalid routing rule {:?}: {}", rule, reason))
}

fn parse_side(rule: &str, side: &str) -> Result<Vec<Matcher>> {
    side.split('&')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| Matcher::parse(rule, m))
        .collect()
}

/// One parsed `condition => consequence` rule
#[derive(Clone, Debug)]
pub struct ConditionRouter {
    rule: String,
    condition: Vec<Matcher>,
    consequence: Vec<Matcher>,
    force: bool,
}

impl ConditionRouter {
    /// Parse a rule; a rule without `=>` is a consequence applied to every consumer
    pub fn parse(rule: &str) -> Result<Self> {
        let trimmed = rule.trim();
        if trimmed.is_empty() {
            return Err(invalid_rule(rule, "rule is empty"));
        }

        let (condition, consequence) = match trimmed.split_once(ARROW) {
            Some((condition, consequence)) => {
                if consequence.contains(ARROW) {
                    return Err(invalid_rule(rule, "more than one \"=>\""));
                }
                (condition, consequence)
            }
            None => ("", trimmed),
        };

        Ok(Self {
            rule: trimmed.to_string(),
            condition: parse_side(rule, condition)?,
            consequence: parse_side(rule, consequence)?,
            force: true,
        })
    }

    /// Build from a `routers` endpoint carrying the rule in its `rule` param
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self> {
        let rule = endpoint.param(RULE_KEY).ok_or_else(|| {
            ClusterError::Configuration(format!("router endpoint {} has no rule", endpoint))
        })?;
        let mut router = Self::parse(rule)?;
        router.force = endpoint.param(FORCE_KEY) != Some("false");
        Ok(router)
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    /// Whether this rule applies to the consumer at all
    pub fn matches_consumer(&self, consumer: &Endpoint) -> bool {
        self.condition.iter().all(|m| m.matches(consumer))
    }

    fn admits(&self, provider: &Endpoint) -> bool {
        !self.consequence.is_empty() && self.consequence.iter().all(|m| m.matches(provider))
    }

    pub fn route(&self, providers: &[Endpoint], consumer: &Endpoint) -> Vec<Endpoint> {
        if providers.is_empty() || !self.matches_consumer(consumer) {
            return providers.to_vec();
        }

        let kept: Vec<Endpoint> = providers.iter().filter(|p| self.admits(p)).cloned().collect();
        if kept.is_empty() && !self.force && !self.consequence.is_empty() {
            warn!(
                "Route rule {:?} filtered out every provider for {}, ignoring it",
                self.rule,
                consumer.service_key()
            );
            return providers.to_vec();
        }
        debug!(
            "Route rule {:?} kept {} of {} provider(s)",
            self.rule,
            kept.len(),
            providers.len()
        );
        kept
    }
}

/// Rules applied as a pipeline in registration order
#[derive(Clone, Debug, Default)]
pub struct RouterChain {
    routers: Vec<ConditionRouter>,
}

impl RouterChain {
    pub fn new(routers: Vec<ConditionRouter>) -> Self {
        Self { routers }
    }

    /// Build from a `routers` notification, skipping sentinels, disabled and invalid rules
    pub fn from_endpoints(endpoints: &[Endpoint]) -> Self {
        let mut ordered: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|e| !e.is_empty_sentinel() && e.is_enabled())
            .collect();
        ordered.sort_by_key(|e| e.timestamp());

        let routers = ordered
            .into_iter()
            .filter_map(|endpoint| match ConditionRouter::from_endpoint(endpoint) {
                Ok(router) => Some(router),
                Err(e) => {
                    warn!("Skipping routing rule from {}: {}", endpoint, e);
                    None
                }
            })
            .collect();
        Self { routers }
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn route(&self, providers: &[Endpoint], consumer: &Endpoint) -> Vec<Endpoint> {
        self.routers
            .iter()
            .fold(providers.to_vec(), |current, router| router.route(&current, consumer))
    }
}
