//! Applying a traffic configuration to the live components

use crate::admission::{ConcurrencyLimiter, RequestRateLimiter};
use crate::load_balancer::BalancerSettings;
use crate::{ClusterError, Result};
use tracing::info;
use traffic_api::TrafficConfig;

/// Push balancing modes and admission limits from `config`; limits change in place
pub fn apply_config(
    config: &TrafficConfig,
    balancer: &BalancerSettings,
    rates: &RequestRateLimiter,
    actives: &ConcurrencyLimiter,
) -> Result<()> {
    config
        .validate()
        .map_err(|e| ClusterError::Configuration(e.to_string()))?;

    balancer.set_global(config.load_balance);
    for service in &config.services {
        let interface = service.interface.as_str();
        if let Some(mode) = service.loadbalance {
            balancer.set_interface(interface, mode);
        }
        if let Some(tps) = service.tps {
            rates.configure(interface, tps);
        }
        if let Some(max) = service.actives {
            actives.configure(interface, max);
        }
        for method in &service.methods {
            if let Some(mode) = method.loadbalance {
                balancer.set_method(interface, &method.name, mode);
            }
            if let Some(max) = method.actives {
                actives.configure(&ConcurrencyLimiter::method_scope(interface, &method.name), max);
            }
        }
    }

    info!(
        "Applied traffic configuration for {} service(s), default balancing {}",
        config.services.len(),
        config.load_balance
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ManualClock;
    use std::sync::Arc;
    use traffic_api::{LoadBalanceMode, ServiceConfig};

    const CONFIG: &str = r#"
load_balance: round_robin
services:
  - interface: com.acme.Greeter
    loadbalance: pick_first
    tps: 1
    actives: 2
    methods:
      - name: hello
        loadbalance: round_robin
        actives: 1
"#;

    #[test]
    fn test_apply_config() {
        let config = TrafficConfig::from_yaml(CONFIG).unwrap();
        let balancer = BalancerSettings::default();
        let rates = RequestRateLimiter::new(Arc::new(ManualClock::new(0)));
        let actives = ConcurrencyLimiter::new();

        apply_config(&config, &balancer, &rates, &actives).unwrap();
        assert_eq!(balancer.global(), LoadBalanceMode::RoundRobin);
        assert_eq!(balancer.interface("com.acme.Greeter"), Some(LoadBalanceMode::PickFirst));
        assert_eq!(
            balancer.method("com.acme.Greeter", "hello"),
            Some(LoadBalanceMode::RoundRobin)
        );
        assert_eq!(rates.limit("com.acme.Greeter"), Some(1));

        assert!(actives.increase("com.acme.Greeter"));
        assert!(actives.increase("com.acme.Greeter"));
        assert!(!actives.increase("com.acme.Greeter"));
        let scoped = ConcurrencyLimiter::method_scope("com.acme.Greeter", "hello");
        assert!(actives.increase(&scoped));
        assert!(!actives.increase(&scoped));
    }

    #[test]
    fn test_reapply_updates_limits_in_place() {
        let balancer = BalancerSettings::default();
        let rates = RequestRateLimiter::new(Arc::new(ManualClock::new(0)));
        let actives = ConcurrencyLimiter::new();
        let config = TrafficConfig::from_yaml(CONFIG).unwrap();
        apply_config(&config, &balancer, &rates, &actives).unwrap();
        assert!(actives.increase("com.acme.Greeter"));

        let raised = TrafficConfig::from_yaml(&CONFIG.replace("actives: 2", "actives: 5")).unwrap();
        apply_config(&raised, &balancer, &rates, &actives).unwrap();
        assert_eq!(actives.active("com.acme.Greeter"), 1);
        for _ in 0..4 {
            assert!(actives.increase("com.acme.Greeter"));
        }
        assert!(!actives.increase("com.acme.Greeter"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrafficConfig {
            services: vec![ServiceConfig::default()],
            ..TrafficConfig::default()
        };
        let err = apply_config(
            &config,
            &BalancerSettings::default(),
            &RequestRateLimiter::default(),
            &ConcurrencyLimiter::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }
}
