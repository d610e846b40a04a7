//! Endpoint descriptors
//!
//! An endpoint is an immutable `protocol://host:port/path?key=value` value.
//! Parameters are kept sorted so the canonical string form, equality and
//! hashing all agree.

use crate::encoding::{decode_component, encode_component};
use crate::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const ANY_VALUE: &str = "*";
pub const EMPTY_PROTOCOL: &str = "empty";

pub const PROVIDERS_CATEGORY: &str = "providers";
pub const ROUTERS_CATEGORY: &str = "routers";
pub const CONFIGURATORS_CATEGORY: &str = "configurators";

pub const INTERFACE_KEY: &str = "interface";
pub const CATEGORY_KEY: &str = "category";
pub const VERSION_KEY: &str = "version";
pub const GROUP_KEY: &str = "group";
pub const WEIGHT_KEY: &str = "weight";
pub const DYNAMIC_KEY: &str = "dynamic";
pub const ENABLED_KEY: &str = "enabled";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const METHOD_KEY: &str = "method";
pub const LOADBALANCE_KEY: &str = "loadbalance";
pub const RULE_KEY: &str = "rule";
pub const FORCE_KEY: &str = "force";

pub const CONDITION_PROTOCOL: &str = "condition";
pub const ANY_HOST: &str = "0.0.0.0";

pub const DEFAULT_WEIGHT: u32 = 100;

/// Addressable service instance plus its attribute parameters
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Parse the wire form `protocol://host:port/path?k=v&...`
    pub fn parse(input: &str) -> Result<Self> {
        let (protocol, rest) = input
            .split_once("://")
            .ok_or_else(|| CoreError::invalid_endpoint(input, "missing protocol separator"))?;
        if protocol.is_empty() {
            return Err(CoreError::invalid_endpoint(input, "empty protocol"));
        }

        let (head, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match head.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (head, ""),
        };
        let (host, port) = parse_authority(input, authority)?;

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    CoreError::invalid_endpoint(input, format!("parameter {:?} has no value", pair))
                })?;
                let key = decode_component(key)?;
                if key.is_empty() {
                    return Err(CoreError::invalid_endpoint(input, "empty parameter name"));
                }
                params.insert(key, decode_component(value)?);
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            host,
            port,
            path: path.to_string(),
            params,
        })
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_start_matches('/').to_string();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn without_param(mut self, key: &str) -> Self {
        self.params.remove(key);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// The explicit "zero members" marker for one category of a query
    pub fn empty_sentinel(query: &Endpoint, category: &str) -> Self {
        query
            .clone()
            .with_protocol(EMPTY_PROTOCOL)
            .with_param(CATEGORY_KEY, category)
    }

    /// Persistent routers-category endpoint carrying a condition rule
    pub fn condition_rule(interface: &str, rule: &str) -> Self {
        Endpoint::new(CONDITION_PROTOCOL, ANY_HOST, 0)
            .with_param(INTERFACE_KEY, interface)
            .with_param(CATEGORY_KEY, ROUTERS_CATEGORY)
            .with_param(DYNAMIC_KEY, "false")
            .with_param(RULE_KEY, rule)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Method-scoped parameter (`<method>.<key>`), falling back to the plain key
    pub fn method_param(&self, method: &str, key: &str) -> Option<&str> {
        self.param(&format!("{}.{}", method, key))
            .or_else(|| self.param(key))
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn service_interface(&self) -> &str {
        self.param(INTERFACE_KEY).unwrap_or(&self.path)
    }

    pub fn category(&self) -> &str {
        self.param(CATEGORY_KEY).unwrap_or(PROVIDERS_CATEGORY)
    }

    /// Categories a query endpoint asks for
    pub fn categories(&self) -> Vec<&str> {
        match self.param(CATEGORY_KEY) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect(),
            None => vec![PROVIDERS_CATEGORY],
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.param(VERSION_KEY)
    }

    pub fn group(&self) -> Option<&str> {
        self.param(GROUP_KEY)
    }

    pub fn weight(&self) -> u32 {
        self.param(WEIGHT_KEY)
            .and_then(|w| w.parse().ok())
            .unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn is_dynamic(&self) -> bool {
        self.param(DYNAMIC_KEY) != Some("false")
    }

    pub fn is_enabled(&self) -> bool {
        self.param(ENABLED_KEY) != Some("false")
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.param(TIMESTAMP_KEY).and_then(|t| t.parse().ok())
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.protocol == EMPTY_PROTOCOL
    }

    /// `group/interface:version`, omitting absent parts
    pub fn service_key(&self) -> String {
        let mut key = String::new();
        if let Some(group) = self.group().filter(|g| !g.is_empty()) {
            key.push_str(group);
            key.push('/');
        }
        key.push_str(self.service_interface());
        if let Some(version) = self.version().filter(|v| !v.is_empty()) {
            key.push(':');
            key.push_str(version);
        }
        key
    }

    /// Whether `candidate` belongs to the set this query endpoint subscribes to
    pub fn matches(&self, candidate: &Endpoint) -> bool {
        let wanted = self.service_interface();
        if wanted != ANY_VALUE && wanted != candidate.service_interface() {
            return false;
        }

        let category = candidate.category();
        if !self
            .categories()
            .iter()
            .any(|c| *c == ANY_VALUE || *c == category)
        {
            return false;
        }

        if !candidate.is_enabled() && self.param(ENABLED_KEY) != Some(ANY_VALUE) {
            return false;
        }

        // Rules and overrides are scoped by interface only
        if category != PROVIDERS_CATEGORY {
            return true;
        }

        value_matches(self.group(), candidate.group())
            && value_matches(self.version(), candidate.version())
    }
}

fn value_matches(wanted: Option<&str>, offered: Option<&str>) -> bool {
    let wanted = wanted.unwrap_or("");
    let offered = offered.unwrap_or("");
    wanted == ANY_VALUE || wanted == offered || wanted.split(',').any(|w| w.trim() == offered)
}

fn parse_authority(input: &str, authority: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| CoreError::invalid_endpoint(input, "unterminated IPv6 host"))?;
        match rest {
            "" => (host, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(CoreError::invalid_endpoint(input, "garbage after IPv6 host")),
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = port
        .ok_or_else(|| CoreError::invalid_endpoint(input, "missing port"))?
        .parse::<u16>()
        .map_err(|_| CoreError::invalid_endpoint(input, format!("invalid port in {:?}", authority)))?;
    Ok((host.to_string(), port))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address())?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, encode_component(key), encode_component(value))?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Endpoint::parse(&raw).map_err(serde::de::Error::custom)
    }
}
