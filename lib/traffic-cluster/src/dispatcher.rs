//! Per-call provider selection and connection acquisition

use crate::admission::RequestRateLimiter;
use crate::directory::ServiceDirectory;
use crate::load_balancer::{LoadBalancer, SelectionScope};
use crate::metrics::TrafficMetrics;
use crate::pool::{AddressSet, ConnectionFactory, ConnectionPool, PooledConnection};
use crate::{ClusterError, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use traffic_core::endpoint::METHOD_KEY;
use traffic_core::Endpoint;

/// CallDispatcher runs directory, routing, balancing, admission and pooling for one service
pub struct CallDispatcher<F: ConnectionFactory> {
    directory: Arc<ServiceDirectory>,
    balancer: Arc<LoadBalancer>,
    rate_limiter: Arc<RequestRateLimiter>,
    pool: Arc<ConnectionPool<F>>,
    metrics: TrafficMetrics,
    scope: SelectionScope,
}

impl<F: ConnectionFactory> CallDispatcher<F> {
    pub fn new(
        directory: Arc<ServiceDirectory>,
        balancer: Arc<LoadBalancer>,
        rate_limiter: Arc<RequestRateLimiter>,
        pool: Arc<ConnectionPool<F>>,
        metrics: TrafficMetrics,
    ) -> Self {
        Self {
            directory,
            balancer,
            rate_limiter,
            pool,
            metrics,
            scope: SelectionScope::Request,
        }
    }

    pub fn with_scope(mut self, scope: SelectionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    /// Choose the provider for one call of `method`
    pub fn select(&self, method: &str) -> Result<Endpoint> {
        let consumer = self.directory.consumer();
        let call = consumer.clone().with_param(METHOD_KEY, method);
        let candidates = self.directory.routed(&call);

        let Some(chosen) = self.balancer.select(consumer, method, &candidates, self.scope) else {
            self.metrics.no_provider_total.inc();
            warn!(
                "No available provider for {}#{} ({} registered)",
                consumer.service_key(),
                method,
                self.directory.providers().len()
            );
            return Err(ClusterError::NoAvailableProvider {
                service: consumer.service_key(),
            });
        };

        self.rate_limiter.add_request(consumer.service_interface())?;
        debug!("Dispatching {}#{} to {}", consumer.service_key(), method, chosen.address());
        Ok(chosen.clone())
    }

    /// Select a provider and take a pooled connection to it
    pub async fn connect(&self, method: &str) -> Result<(Endpoint, PooledConnection<F::Conn>)> {
        let chosen = self.select(method)?;
        let addresses = AddressSet::single(chosen.address());
        let connection = self.pool.take_or_create(&addresses, chosen.params()).await?;
        Ok((chosen, connection))
    }

    /// Hand a connection back once the call completes
    pub async fn release(&self, connection: PooledConnection<F::Conn>) {
        self.pool.give_back(connection).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ManualClock;
    use crate::error::AdmissionKind;
    use crate::load_balancer::BalancerSettings;
    use crate::pool::Connection;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use traffic_api::LoadBalanceMode;
    use traffic_core::endpoint::{INTERFACE_KEY, WEIGHT_KEY};
    use traffic_core::Registry;

    struct NoopConnection;

    #[async_trait]
    impl Connection for NoopConnection {
        async fn shutdown(&self) {}
    }

    struct NoopFactory;

    #[async_trait]
    impl ConnectionFactory for NoopFactory {
        type Conn = NoopConnection;

        async fn connect(&self, _: &AddressSet, _: &BTreeMap<String, String>) -> Result<NoopConnection> {
            Ok(NoopConnection)
        }
    }

    fn consumer() -> Endpoint {
        Endpoint::new("consumer", "10.0.0.9", 0).with_param(INTERFACE_KEY, "com.acme.Greeter")
    }

    fn provider(host: &str, weight: u32) -> Endpoint {
        Endpoint::new("tri", host, 50051)
            .with_param(INTERFACE_KEY, "com.acme.Greeter")
            .with_param(WEIGHT_KEY, weight.to_string())
    }

    async fn dispatcher(registry: &Registry, tps: i64) -> CallDispatcher<NoopFactory> {
        let metrics = TrafficMetrics::new().unwrap();
        let directory = ServiceDirectory::subscribe(registry, consumer(), Some(metrics.clone()))
            .await
            .unwrap();
        let balancer = Arc::new(LoadBalancer::new(BalancerSettings::new(LoadBalanceMode::RoundRobin)));
        let rate_limiter = Arc::new(
            RequestRateLimiter::new(Arc::new(ManualClock::new(0))).with_metrics(metrics.clone()),
        );
        rate_limiter.configure("com.acme.Greeter", tps);
        let pool = Arc::new(ConnectionPool::new(NoopFactory, Duration::from_secs(60)).unwrap());
        CallDispatcher::new(directory, balancer, rate_limiter, pool, metrics)
    }

    #[tokio::test]
    async fn test_select_spreads_by_weight() {
        let registry = Registry::new();
        let dispatcher = dispatcher(&registry, 0).await;
        registry
            .notify(vec![provider("10.0.0.1", 2), provider("10.0.0.2", 1)])
            .await;

        let hosts: Vec<String> = (0..3)
            .map(|_| dispatcher.select("hello").unwrap().host().to_string())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_no_provider_is_not_retryable() {
        let registry = Registry::new();
        let dispatcher = dispatcher(&registry, 0).await;
        let err = dispatcher.select("hello").unwrap_err();
        assert!(matches!(err, ClusterError::NoAvailableProvider { .. }));
        assert!(!err.is_retryable());

        registry.notify(vec![provider("10.0.0.1", 1)]).await;
        registry
            .notify(vec![Endpoint::condition_rule("com.acme.Greeter", "method = hello =>")])
            .await;
        assert!(dispatcher.select("hello").is_err());
        assert!(dispatcher.select("bye").is_ok());
        assert_eq!(dispatcher.metrics.no_provider_total.get() as u64, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_as_retryable() {
        let registry = Registry::new();
        let dispatcher = dispatcher(&registry, 1).await;
        registry.notify(vec![provider("10.0.0.1", 1)]).await;

        assert!(dispatcher.select("hello").is_ok());
        let err = dispatcher.select("hello").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(dispatcher.metrics.rejections(AdmissionKind::Rate), 1);
    }

    #[tokio::test]
    async fn test_connect_reuses_released_connection() {
        let registry = Registry::new();
        let dispatcher = dispatcher(&registry, 0)
            .await
            .with_scope(SelectionScope::Connection);
        registry
            .notify(vec![provider("10.0.0.1", 1), provider("10.0.0.2", 1)])
            .await;

        let (first_endpoint, first) = dispatcher.connect("hello").await.unwrap();
        assert_eq!(first.addresses(), &AddressSet::single(first_endpoint.address()));
        let id = first.id();
        dispatcher.release(first).await;

        let (again_endpoint, again) = dispatcher.connect("hello").await.unwrap();
        assert_eq!(again_endpoint, first_endpoint);
        assert_eq!(again.id(), id);
    }
}
