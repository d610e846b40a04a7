use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use traffic_api::TrafficConfig;
use traffic_cluster::{
    apply_config, AddressSet, BalancerSettings, CallDispatcher, ClusterError, ConcurrencyLimiter,
    Connection, ConnectionFactory, ConnectionPool, LoadBalancer, RequestRateLimiter,
    ServiceDirectory, SystemClock, TrafficMetrics,
};
use traffic_core::endpoint::{INTERFACE_KEY, WEIGHT_KEY};
use traffic_core::{Endpoint, MemoryStore, RegistryOptions, RegistryService, StoreRegistry};

const CONFIG_ENV: &str = "TRAFFIC_CONFIG";
const DISPATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Connection that only records its target
struct SimulatedConnection {
    addresses: AddressSet,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn shutdown(&self) {
        debug!("Closing simulated connection to {}", self.addresses);
    }
}

struct SimulatedFactory;

#[async_trait]
impl ConnectionFactory for SimulatedFactory {
    type Conn = SimulatedConnection;

    async fn connect(
        &self,
        addresses: &AddressSet,
        _attributes: &BTreeMap<String, String>,
    ) -> traffic_cluster::Result<SimulatedConnection> {
        Ok(SimulatedConnection {
            addresses: addresses.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting traffic-agent...");

    let config = load_config()?;
    let metrics = TrafficMetrics::new()?;

    let store = Arc::new(MemoryStore::new());
    let registry = StoreRegistry::start(
        store,
        RegistryOptions {
            root: config.registry.root.clone(),
            lookup_timeout: config.registry.lookup_timeout(),
            retry_period: config.registry.retry_period(),
        },
    )
    .await;
    info!("Store registry initialized under {}", config.registry.root);

    let balancer = Arc::new(LoadBalancer::new(BalancerSettings::default()));
    let rate_limiter = Arc::new(RequestRateLimiter::new(Arc::new(SystemClock)).with_metrics(metrics.clone()));
    let concurrency = Arc::new(ConcurrencyLimiter::new().with_metrics(metrics.clone()));
    apply_config(&config, balancer.settings(), &rate_limiter, &concurrency)?;

    publish_providers(&config, registry.as_ref()).await?;
    for service in &config.services {
        for rule in &service.rules {
            registry.publish_rule(&service.interface, rule).await?;
        }
    }

    let pool = Arc::new(
        ConnectionPool::new(SimulatedFactory, config.pool.idle_timeout())?.with_metrics(metrics.clone()),
    );

    let mut dispatchers = Vec::new();
    for service in &config.services {
        let consumer = Endpoint::new("consumer", "127.0.0.1", 0)
            .with_param(INTERFACE_KEY, service.interface.as_str());
        let directory = ServiceDirectory::subscribe(registry.as_ref(), consumer, Some(metrics.clone())).await?;
        info!(
            "Directory for {} starts with {} provider(s)",
            service.interface,
            directory.providers().len()
        );
        dispatchers.push(CallDispatcher::new(
            directory,
            balancer.clone(),
            rate_limiter.clone(),
            pool.clone(),
            metrics.clone(),
        ));
    }

    let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for dispatcher in &dispatchers {
                    dispatch_once(dispatcher, &concurrency).await;
                }
                match metrics.gather() {
                    Ok(text) => debug!("Metrics:\n{}", text),
                    Err(e) => warn!("Failed to gather metrics: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    for dispatcher in &dispatchers {
        if let Err(e) = dispatcher.directory().unsubscribe(registry.as_ref()).await {
            warn!("Failed to unsubscribe directory: {}", e);
        }
    }
    pool.clear().await;
    registry.destroy().await;
    info!("traffic-agent stopped");
    Ok(())
}

fn load_config() -> Result<TrafficConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("reading traffic config {}", path))?;
            let config = TrafficConfig::from_yaml(&source)
                .with_context(|| format!("parsing traffic config {}", path))?;
            info!("Loaded traffic config from {}", path);
            Ok(config)
        }
        None => {
            warn!("No traffic config given (argument or {}), using defaults", CONFIG_ENV);
            Ok(TrafficConfig::default())
        }
    }
}

async fn publish_providers<R: RegistryService + ?Sized>(config: &TrafficConfig, registry: &R) -> Result<()> {
    for raw in &config.providers {
        let mut endpoint = Endpoint::parse(raw).with_context(|| format!("provider {}", raw))?;
        if endpoint.param(WEIGHT_KEY).is_none() {
            if let Some(weight) = config
                .service(endpoint.service_interface())
                .and_then(|s| s.weight)
            {
                endpoint = endpoint.with_param(WEIGHT_KEY, weight.to_string());
            }
        }
        registry.register(endpoint.clone()).await?;
        info!("Published provider {}", endpoint);
    }
    Ok(())
}

async fn dispatch_once(dispatcher: &CallDispatcher<SimulatedFactory>, concurrency: &ConcurrencyLimiter) {
    let interface = dispatcher.directory().consumer().service_interface().to_string();
    let (endpoint, connection) = match dispatcher.connect("ping").await {
        Ok(picked) => picked,
        Err(e @ ClusterError::AdmissionRejected { .. }) => {
            debug!("Call to {} throttled: {}", interface, e);
            return;
        }
        Err(e) => {
            error!("Call to {} failed: {}", interface, e);
            return;
        }
    };

    match concurrency.acquire(&interface) {
        Ok(_permit) => info!(
            "Dispatched {}#ping to {} over connection {}",
            interface,
            endpoint.address(),
            connection.id()
        ),
        Err(e) => debug!("Provider {} busy: {}", endpoint.address(), e),
    }
    dispatcher.release(connection).await;
}
