//! Registry backed by a coordination store
//!
//! Registrations are written through as nodes under
//! `{root}/{interface}/{category}/{encoded endpoint}`, subscriptions become
//! child watches whose events are pumped into the local registry. Store
//! failures never reach callers: they are logged and retried by a periodic
//! failback task, while the local cache keeps serving the last known state.

use crate::encoding::{decode_component, encode_component};
use crate::endpoint::{
    ANY_VALUE, CONFIGURATORS_CATEGORY, INTERFACE_KEY, PROVIDERS_CATEGORY, ROUTERS_CATEGORY,
};
use crate::registry::{destroy_via, lookup_via, DEFAULT_LOOKUP_TIMEOUT};
use crate::store::{ChildEvent, CoordinationStore, StoreError, StoreResult, StoreState, WatchId};
use crate::{Endpoint, NotifyListener, Registry, RegistryService, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Options for a store-backed registry
#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Root path all nodes live under
    pub root: String,
    /// Upper bound for an uncached lookup
    pub lookup_timeout: Duration,
    /// Period of the failback retry task
    pub retry_period: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            root: "/rpc".to_string(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            retry_period: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct WatchedPath {
    id: Option<WatchId>,
    // (subscribed query, query scoped to this path's interface)
    owners: Vec<(Endpoint, Endpoint)>,
}

#[derive(Default)]
struct FailedOps {
    registered: HashSet<Endpoint>,
    unregistered: HashSet<Endpoint>,
    subscribed: HashSet<Endpoint>,
}

/// StoreRegistry persists through a coordination store and caches locally
pub struct StoreRegistry<S: CoordinationStore> {
    local: Registry,
    store: Arc<S>,
    options: RegistryOptions,
    events: mpsc::UnboundedSender<ChildEvent>,
    watches: Mutex<HashMap<String, WatchedPath>>,
    failed: Mutex<FailedOps>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl<S: CoordinationStore> StoreRegistry<S> {
    /// Create the registry and spawn its watch, state and retry tasks
    pub async fn start(store: Arc<S>, options: RegistryOptions) -> Arc<Self> {
        let (events, mut child_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        store.watch_state(state_tx).await;

        let registry = Arc::new(Self {
            local: Registry::with_lookup_timeout(options.lookup_timeout),
            store,
            options,
            events,
            watches: Mutex::new(HashMap::new()),
            failed: Mutex::new(FailedOps::default()),
            tasks: StdMutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&registry);
        let child_pump = tokio::spawn(async move {
            while let Some(event) = child_rx.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                registry.on_children_changed(event).await;
            }
        });

        let weak = Arc::downgrade(&registry);
        let state_pump = tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                match state {
                    StoreState::Connected => info!("Coordination store connected"),
                    StoreState::Disconnected => {
                        warn!("Coordination store disconnected, serving cached state")
                    }
                    StoreState::Reconnected => registry.recover().await,
                }
            }
        });

        let weak = Arc::downgrade(&registry);
        let period = registry.options.retry_period.max(Duration::from_millis(10));
        let retry = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                registry.retry_failed().await;
            }
        });

        if let Ok(mut tasks) = registry.tasks.lock() {
            tasks.extend([child_pump, state_pump, retry]);
        }
        info!("Store registry started under {}", registry.options.root);
        registry
    }

    /// The local cache this registry feeds
    pub fn local(&self) -> &Registry {
        &self.local
    }

    /// Publish a condition routing rule for an interface
    pub async fn publish_rule(&self, interface: &str, rule: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::condition_rule(interface, rule);
        self.register(endpoint.clone()).await?;
        Ok(endpoint)
    }

    /// Number of operations waiting for the failback task
    pub async fn pending_retries(&self) -> usize {
        let failed = self.failed.lock().await;
        failed.registered.len() + failed.unregistered.len() + failed.subscribed.len()
    }

    /// Retry every failed registration, unregistration and subscription once
    pub async fn retry_failed(&self) {
        let (registered, unregistered, subscribed) = {
            let failed = self.failed.lock().await;
            (
                failed.registered.iter().cloned().collect::<Vec<_>>(),
                failed.unregistered.iter().cloned().collect::<Vec<_>>(),
                failed.subscribed.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if registered.is_empty() && unregistered.is_empty() && subscribed.is_empty() {
            return;
        }
        debug!(
            "Retrying {} register, {} unregister, {} subscribe operations",
            registered.len(),
            unregistered.len(),
            subscribed.len()
        );

        for endpoint in registered {
            match self.write_node(&endpoint).await {
                Ok(()) => {
                    self.failed.lock().await.registered.remove(&endpoint);
                    info!("Retry register succeeded: {}", endpoint);
                }
                Err(e) => warn!("Retry register failed for {}: {}", endpoint, e),
            }
        }
        for endpoint in unregistered {
            match self.remove_node(&endpoint).await {
                Ok(()) => {
                    self.failed.lock().await.unregistered.remove(&endpoint);
                    info!("Retry unregister succeeded: {}", endpoint);
                }
                Err(e) => warn!("Retry unregister failed for {}: {}", endpoint, e),
            }
        }
        for query in subscribed {
            if !self.local.has_listeners(&query).await {
                self.failed.lock().await.subscribed.remove(&query);
                continue;
            }
            match self.watch_query(&query).await {
                Ok(()) => {
                    self.failed.lock().await.subscribed.remove(&query);
                    info!("Retry subscribe succeeded: {}", query.service_key());
                }
                Err(e) => warn!("Retry subscribe failed for {}: {}", query.service_key(), e),
            }
        }
    }

    /// Re-create registrations and re-read watched paths after a session loss
    async fn recover(&self) {
        let registered = self.local.registered().await;
        let queries = self.local.subscribed_queries().await;
        info!(
            "Coordination store reconnected, recovering {} registrations and {} subscriptions",
            registered.len(),
            queries.len()
        );
        for endpoint in registered {
            if let Err(e) = self.write_node(&endpoint).await {
                warn!("Recover register failed for {}: {}", endpoint, e);
                self.failed.lock().await.registered.insert(endpoint);
            }
        }
        for query in queries {
            if let Err(e) = self.watch_query(&query).await {
                warn!("Recover subscribe failed for {}: {}", query.service_key(), e);
                self.failed.lock().await.subscribed.insert(query);
            }
        }
    }

    fn category_path(&self, interface: &str, category: &str) -> String {
        format!("{}/{}/{}", self.options.root, encode_component(interface), category)
    }

    fn node_path(&self, endpoint: &Endpoint) -> String {
        format!(
            "{}/{}",
            self.category_path(endpoint.service_interface(), endpoint.category()),
            encode_component(&endpoint.to_string())
        )
    }

    async fn write_node(&self, endpoint: &Endpoint) -> StoreResult<()> {
        match self
            .store
            .create(&self.node_path(endpoint), endpoint.is_dynamic())
            .await
        {
            Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_node(&self, endpoint: &Endpoint) -> StoreResult<()> {
        match self.store.delete(&self.node_path(endpoint)).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        match self.store.create(path, false).await {
            Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Watch `path` on behalf of `owner` and return its current children
    async fn watch_path(&self, path: &str, owner: &Endpoint, scoped: &Endpoint) -> StoreResult<Vec<String>> {
        self.ensure_path(path).await?;
        let mut watches = self.watches.lock().await;
        let watched = watches.entry(path.to_string()).or_default();
        if !watched.owners.iter().any(|(o, s)| o == owner && s == scoped) {
            watched.owners.push((owner.clone(), scoped.clone()));
        }
        match watched.id {
            Some(_) => self.store.get_children(path).await,
            None => {
                let (id, children) = self.store.watch_children(path, self.events.clone()).await?;
                watched.id = Some(id);
                Ok(children)
            }
        }
    }

    async fn watch_query(&self, query: &Endpoint) -> StoreResult<()> {
        if query.service_interface() != ANY_VALUE {
            return self.watch_categories(query, query).await;
        }

        let root = self.options.root.clone();
        let interfaces = self.watch_path(&root, query, query).await?;
        for interface in interfaces {
            let scoped = match decode_component(&interface) {
                Ok(name) => query.clone().with_param(INTERFACE_KEY, name),
                Err(e) => {
                    warn!("Skipping undecodable interface node {}: {}", interface, e);
                    continue;
                }
            };
            self.watch_categories(query, &scoped).await?;
        }
        Ok(())
    }

    async fn watch_categories(&self, owner: &Endpoint, scoped: &Endpoint) -> StoreResult<()> {
        let mut updates = Vec::new();
        for category in expand_categories(scoped) {
            let path = self.category_path(scoped.service_interface(), category);
            let children = self.watch_path(&path, owner, scoped).await?;
            updates.extend(decode_children(scoped, category, &children));
        }
        self.local.notify(updates).await;
        Ok(())
    }

    async fn on_children_changed(&self, event: ChildEvent) {
        if event.path == self.options.root {
            self.on_interfaces_changed(event.children).await;
            return;
        }

        let owners = {
            let watches = self.watches.lock().await;
            match watches.get(&event.path) {
                Some(watched) => watched.owners.clone(),
                None => return,
            }
        };
        let category = event.path.rsplit('/').next().unwrap_or(PROVIDERS_CATEGORY);

        let mut seen = HashSet::new();
        let mut updates = Vec::new();
        for (_, scoped) in &owners {
            for endpoint in decode_children(scoped, category, &event.children) {
                if seen.insert(endpoint.clone()) {
                    updates.push(endpoint);
                }
            }
        }
        debug!("Children of {} changed, {} update(s)", event.path, updates.len());
        self.local.notify(updates).await;
    }

    async fn on_interfaces_changed(&self, interfaces: Vec<String>) {
        let wildcard_owners: Vec<Endpoint> = {
            let watches = self.watches.lock().await;
            match watches.get(&self.options.root) {
                Some(watched) => watched.owners.iter().map(|(owner, _)| owner.clone()).collect(),
                None => return,
            }
        };

        for owner in wildcard_owners {
            for interface in &interfaces {
                let Ok(name) = decode_component(interface) else { continue };
                let scoped = owner.clone().with_param(INTERFACE_KEY, name);
                let known = {
                    let watches = self.watches.lock().await;
                    expand_categories(&scoped).iter().all(|category| {
                        watches
                            .get(&self.category_path(scoped.service_interface(), category))
                            .map_or(false, |w| w.owners.iter().any(|(o, _)| o == &owner))
                    })
                };
                if known {
                    continue;
                }
                if let Err(e) = self.watch_categories(&owner, &scoped).await {
                    warn!("Failed to watch new interface {}: {}", scoped.service_interface(), e);
                    self.failed.lock().await.subscribed.insert(owner.clone());
                }
            }
        }
    }

    async fn drop_watches(&self, owner: &Endpoint) {
        let released: Vec<WatchId> = {
            let mut watches = self.watches.lock().await;
            let mut released = Vec::new();
            watches.retain(|_, watched| {
                watched.owners.retain(|(o, _)| o != owner);
                if watched.owners.is_empty() {
                    released.extend(watched.id.take());
                    false
                } else {
                    true
                }
            });
            released
        };
        for id in released {
            self.store.unwatch(id).await;
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn expand_categories(query: &Endpoint) -> Vec<&str> {
    let categories = query.categories();
    if categories.contains(&ANY_VALUE) {
        vec![PROVIDERS_CATEGORY, ROUTERS_CATEGORY, CONFIGURATORS_CATEGORY]
    } else {
        categories
    }
}

fn decode_children(scoped: &Endpoint, category: &str, children: &[String]) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = children
        .iter()
        .filter_map(|child| {
            match decode_component(child).and_then(|raw| Endpoint::parse(&raw)) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!("Ignoring malformed endpoint node {}: {}", child, e);
                    None
                }
            }
        })
        .collect();
    if endpoints.is_empty() {
        endpoints.push(Endpoint::empty_sentinel(scoped, category));
    }
    endpoints
}

#[async_trait]
impl<S: CoordinationStore> RegistryService for StoreRegistry<S> {
    async fn register(&self, endpoint: Endpoint) -> Result<()> {
        self.local.register(endpoint.clone()).await?;
        {
            let mut failed = self.failed.lock().await;
            failed.registered.remove(&endpoint);
            failed.unregistered.remove(&endpoint);
        }
        if let Err(e) = self.write_node(&endpoint).await {
            error!("Failed to register {} in coordination store, will retry: {}", endpoint, e);
            self.failed.lock().await.registered.insert(endpoint);
        }
        Ok(())
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()> {
        self.local.unregister(endpoint).await?;
        {
            let mut failed = self.failed.lock().await;
            failed.registered.remove(endpoint);
            failed.unregistered.remove(endpoint);
        }
        if let Err(e) = self.remove_node(endpoint).await {
            error!("Failed to unregister {} from coordination store, will retry: {}", endpoint, e);
            self.failed.lock().await.unregistered.insert(endpoint.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, query: Endpoint, listener: Arc<dyn NotifyListener>) -> Result<()> {
        self.local.subscribe(query.clone(), listener).await?;
        if let Err(e) = self.watch_query(&query).await {
            error!("Failed to subscribe {} in coordination store, will retry: {}", query.service_key(), e);
            self.failed.lock().await.subscribed.insert(query);
        }
        Ok(())
    }

    async fn unsubscribe(&self, query: &Endpoint, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        self.local.unsubscribe(query, listener).await?;
        if !self.local.has_listeners(query).await {
            self.failed.lock().await.subscribed.remove(query);
            self.drop_watches(query).await;
        }
        Ok(())
    }

    async fn lookup(&self, query: &Endpoint) -> Result<Vec<Endpoint>> {
        lookup_via(self, &self.local, query).await
    }

    async fn destroy(&self) {
        destroy_via(self, &self.local).await;
        self.abort_tasks();
        info!("Store registry under {} destroyed", self.options.root);
    }
}

impl<S: CoordinationStore> Drop for StoreRegistry<S> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
