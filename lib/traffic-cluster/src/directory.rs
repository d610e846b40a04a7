//! Live provider list and routing rules of one consumed service

use crate::metrics::TrafficMetrics;
use crate::router::RouterChain;
use crate::Result;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use traffic_core::endpoint::{CATEGORY_KEY, CONFIGURATORS_CATEGORY, PROVIDERS_CATEGORY, ROUTERS_CATEGORY};
use traffic_core::{Endpoint, NotifyListener, RegistryService};

/// ServiceDirectory follows `providers` and `routers` notifications for a consumer
pub struct ServiceDirectory {
    consumer: Endpoint,
    providers: RwLock<Vec<Endpoint>>,
    routers: RwLock<RouterChain>,
    metrics: Option<TrafficMetrics>,
}

impl ServiceDirectory {
    pub fn new(consumer: Endpoint) -> Self {
        Self {
            consumer,
            providers: RwLock::new(Vec::new()),
            routers: RwLock::new(RouterChain::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TrafficMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribe a new directory for `consumer` and return it once subscribed
    pub async fn subscribe<R>(registry: &R, consumer: Endpoint, metrics: Option<TrafficMetrics>) -> Result<Arc<Self>>
    where
        R: RegistryService + ?Sized,
    {
        let mut directory = Self::new(consumer);
        directory.metrics = metrics;
        let directory = Arc::new(directory);
        let listener: Arc<dyn NotifyListener> = directory.clone();
        registry.subscribe(directory.query(), listener).await?;
        info!("Subscribed directory for {}", directory.consumer.service_key());
        Ok(directory)
    }

    /// Detach a directory previously returned by `subscribe`
    pub async fn unsubscribe<R>(self: &Arc<Self>, registry: &R) -> Result<()>
    where
        R: RegistryService + ?Sized,
    {
        let listener: Arc<dyn NotifyListener> = self.clone();
        registry.unsubscribe(&self.query(), &listener).await?;
        Ok(())
    }

    pub fn consumer(&self) -> &Endpoint {
        &self.consumer
    }

    /// Registry query covering providers and routing rules
    pub fn query(&self) -> Endpoint {
        self.consumer.clone().with_param(
            CATEGORY_KEY,
            format!("{},{}", PROVIDERS_CATEGORY, ROUTERS_CATEGORY),
        )
    }

    pub fn providers(&self) -> Vec<Endpoint> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn router_count(&self) -> usize {
        self.routers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Providers left after the routing rules for this call
    pub fn routed(&self, call: &Endpoint) -> Vec<Endpoint> {
        let providers = self.providers();
        let routers = self.routers.read().unwrap_or_else(PoisonError::into_inner);
        routers.route(&providers, call)
    }
}

impl NotifyListener for ServiceDirectory {
    fn notify(&self, endpoints: &[Endpoint]) {
        let Some(first) = endpoints.first() else { return };
        let category = first.category().to_string();
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(&category);
        }

        let members: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| !e.is_empty_sentinel())
            .cloned()
            .collect();
        match category.as_str() {
            PROVIDERS_CATEGORY => {
                info!(
                    "Provider list for {} now has {} endpoint(s)",
                    self.consumer.service_key(),
                    members.len()
                );
                *self.providers.write().unwrap_or_else(PoisonError::into_inner) = members;
            }
            ROUTERS_CATEGORY => {
                let chain = RouterChain::from_endpoints(&members);
                info!(
                    "Routing rules for {} now has {} rule(s)",
                    self.consumer.service_key(),
                    chain.len()
                );
                *self.routers.write().unwrap_or_else(PoisonError::into_inner) = chain;
            }
            CONFIGURATORS_CATEGORY => {
                debug!("Ignoring {} configurator(s) for {}", members.len(), self.consumer.service_key());
            }
            other => debug!("Ignoring notification of unknown category {}", other),
        }
    }
}
