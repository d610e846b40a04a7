//! Declarative configuration types for the traffic-management core
//!
//! This library defines the documents operators hand to the core:
//! - TrafficConfig: registry, pool and per-service traffic settings
//! - ServiceConfig / MethodConfig: load-balance mode and admission limits
//! - LoadBalanceMode: the selection strategies understood by the balancer

pub mod config;
pub mod strategy;

pub use config::{
    ConfigError, MethodConfig, PoolSettings, RegistrySettings, ServiceConfig, TrafficConfig,
};
pub use strategy::LoadBalanceMode;
