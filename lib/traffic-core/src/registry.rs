//! Process-local registry of registered, subscribed and notified endpoints

use crate::endpoint::ANY_VALUE;
use crate::{CoreError, Endpoint, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives the full new endpoint list of one category
pub trait NotifyListener: Send + Sync {
    fn notify(&self, endpoints: &[Endpoint]);
}

/// Registration, subscription and lookup of endpoints
#[async_trait]
pub trait RegistryService: Send + Sync {
    async fn register(&self, endpoint: Endpoint) -> Result<()>;

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()>;

    /// Add a listener; cached notifications are replayed to it before this returns
    async fn subscribe(&self, query: Endpoint, listener: Arc<dyn NotifyListener>) -> Result<()>;

    async fn unsubscribe(&self, query: &Endpoint, listener: &Arc<dyn NotifyListener>) -> Result<()>;

    /// Current non-empty members for a query, waiting for the first notification if needed
    async fn lookup(&self, query: &Endpoint) -> Result<Vec<Endpoint>>;

    /// Unregister dynamic endpoints and drop every subscription
    async fn destroy(&self);
}

type Listeners = Vec<Arc<dyn NotifyListener>>;

/// Registry maintains the local view every downstream component reads
pub struct Registry {
    registered: RwLock<HashSet<Endpoint>>,
    subscribed: RwLock<HashMap<Endpoint, Listeners>>,
    // query -> category -> endpoints
    notified: RwLock<HashMap<Endpoint, BTreeMap<String, Vec<Endpoint>>>>,
    lookup_timeout: Duration,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_lookup_timeout(DEFAULT_LOOKUP_TIMEOUT)
    }

    pub fn with_lookup_timeout(lookup_timeout: Duration) -> Self {
        Self {
            registered: RwLock::new(HashSet::new()),
            subscribed: RwLock::new(HashMap::new()),
            notified: RwLock::new(HashMap::new()),
            lookup_timeout,
        }
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// Replace the cached categories present in `updates` for every matching
    /// subscription and deliver each new category list to its listeners
    pub async fn notify(&self, updates: Vec<Endpoint>) {
        if updates.is_empty() {
            return;
        }

        let subscriptions: Vec<(Endpoint, Listeners)> = {
            let subscribed = self.subscribed.read().await;
            subscribed
                .iter()
                .map(|(query, listeners)| (query.clone(), listeners.clone()))
                .collect()
        };

        let mut deliveries: Vec<(Listeners, Vec<Endpoint>)> = Vec::new();
        {
            let mut notified = self.notified.write().await;
            for (query, listeners) in subscriptions {
                let mut by_category: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
                for endpoint in updates.iter().filter(|u| query.matches(u)) {
                    by_category
                        .entry(endpoint.category().to_string())
                        .or_default()
                        .push(endpoint.clone());
                }
                if by_category.is_empty() {
                    continue;
                }

                let cache = notified.entry(query.clone()).or_default();
                for (category, update) in by_category {
                    let list = merge_category(cache.get(&category), update);
                    debug!(
                        "Notify {} {} endpoint(s) for {}",
                        list.len(),
                        category,
                        query.service_key()
                    );
                    cache.insert(category, list.clone());
                    deliveries.push((listeners.clone(), list));
                }
            }
        }

        for (listeners, list) in deliveries {
            for listener in listeners {
                listener.notify(&list);
            }
        }
    }

    /// Flattened non-empty members of the cached notification, if any
    pub async fn cached(&self, query: &Endpoint) -> Option<Vec<Endpoint>> {
        let notified = self.notified.read().await;
        notified.get(query).map(|categories| {
            categories
                .values()
                .flatten()
                .filter(|e| !e.is_empty_sentinel())
                .cloned()
                .collect()
        })
    }

    /// Cached category lists for a query, sentinels included
    pub async fn notified(&self, query: &Endpoint) -> Option<BTreeMap<String, Vec<Endpoint>>> {
        self.notified.read().await.get(query).cloned()
    }

    pub async fn registered(&self) -> Vec<Endpoint> {
        self.registered.read().await.iter().cloned().collect()
    }

    pub async fn is_registered(&self, endpoint: &Endpoint) -> bool {
        self.registered.read().await.contains(endpoint)
    }

    pub async fn subscribed_queries(&self) -> Vec<Endpoint> {
        self.subscribed.read().await.keys().cloned().collect()
    }

    pub async fn has_listeners(&self, query: &Endpoint) -> bool {
        self.subscribed
            .read()
            .await
            .get(query)
            .map_or(false, |listeners| !listeners.is_empty())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryService for Registry {
    async fn register(&self, endpoint: Endpoint) -> Result<()> {
        let mut registered = self.registered.write().await;
        if registered.insert(endpoint.clone()) {
            debug!("Registered endpoint: {}", endpoint);
        }
        Ok(())
    }

    async fn unregister(&self, endpoint: &Endpoint) -> Result<()> {
        let mut registered = self.registered.write().await;
        if registered.remove(endpoint) {
            debug!("Unregistered endpoint: {}", endpoint);
        }
        Ok(())
    }

    async fn subscribe(&self, query: Endpoint, listener: Arc<dyn NotifyListener>) -> Result<()> {
        validate_query(&query)?;
        {
            let mut subscribed = self.subscribed.write().await;
            let listeners = subscribed.entry(query.clone()).or_default();
            if !listeners.iter().any(|l| same_listener(l, &listener)) {
                listeners.push(listener.clone());
            }
        }
        debug!("Subscribed to {}", query.service_key());

        let replay = self.notified(&query).await;
        if let Some(categories) = replay {
            for list in categories.values() {
                listener.notify(list);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, query: &Endpoint, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        let drained = {
            let mut subscribed = self.subscribed.write().await;
            match subscribed.get_mut(query) {
                Some(listeners) => {
                    listeners.retain(|l| !same_listener(l, listener));
                    if listeners.is_empty() {
                        subscribed.remove(query);
                        true
                    } else {
                        false
                    }
                }
                None => return Ok(()),
            }
        };
        if drained {
            // Nothing keeps this entry current any more
            self.notified.write().await.remove(query);
        }
        debug!("Unsubscribed from {}", query.service_key());
        Ok(())
    }

    async fn lookup(&self, query: &Endpoint) -> Result<Vec<Endpoint>> {
        lookup_via(self, self, query).await
    }

    async fn destroy(&self) {
        destroy_via(self, self).await;
    }
}

/// Replace the members of the interfaces present in `update`, keeping the
/// others; a wildcard-interface update replaces the whole category
fn merge_category(cached: Option<&Vec<Endpoint>>, update: Vec<Endpoint>) -> Vec<Endpoint> {
    let interfaces: HashSet<String> = update
        .iter()
        .map(|e| e.service_interface().to_string())
        .collect();
    let mut merged: Vec<Endpoint> = match cached {
        Some(existing) if !interfaces.contains(ANY_VALUE) => existing
            .iter()
            .filter(|e| !interfaces.contains(e.service_interface()))
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    merged.extend(update);
    if merged.iter().any(|e| !e.is_empty_sentinel()) {
        merged.retain(|e| !e.is_empty_sentinel());
    }
    merged
}

/// Lookup through `service`, using `local` as the cache it feeds
pub(crate) async fn lookup_via<R>(service: &R, local: &Registry, query: &Endpoint) -> Result<Vec<Endpoint>>
where
    R: RegistryService + ?Sized,
{
    if let Some(endpoints) = local.cached(query).await {
        return Ok(endpoints);
    }

    let (listener, first) = OneShotListener::new();
    let listener: Arc<dyn NotifyListener> = listener;
    service.subscribe(query.clone(), listener.clone()).await?;

    let waited = tokio::time::timeout(local.lookup_timeout, first).await;
    let endpoints = local.cached(query).await;
    if let Err(e) = service.unsubscribe(query, &listener).await {
        warn!("Failed to drop lookup listener for {}: {}", query.service_key(), e);
    }

    match (waited, endpoints) {
        (_, Some(endpoints)) => Ok(endpoints),
        (Ok(_), None) => Ok(Vec::new()),
        (Err(_), None) => Err(CoreError::CoordinationStore(format!(
            "lookup of {} got no notification within {:?}",
            query.service_key(),
            local.lookup_timeout
        ))),
    }
}

pub(crate) async fn destroy_via<R>(service: &R, local: &Registry)
where
    R: RegistryService + ?Sized,
{
    let dynamic: Vec<Endpoint> = local
        .registered()
        .await
        .into_iter()
        .filter(Endpoint::is_dynamic)
        .collect();
    for endpoint in dynamic {
        match service.unregister(&endpoint).await {
            Ok(()) => info!("Destroy unregister endpoint: {}", endpoint),
            Err(e) => warn!("Failed to unregister {} on destroy: {}", endpoint, e),
        }
    }

    let subscriptions: Vec<(Endpoint, Listeners)> = local
        .subscribed
        .read()
        .await
        .iter()
        .map(|(query, listeners)| (query.clone(), listeners.clone()))
        .collect();
    for (query, listeners) in subscriptions {
        for listener in listeners {
            match service.unsubscribe(&query, &listener).await {
                Ok(()) => info!("Destroy unsubscribe: {}", query.service_key()),
                Err(e) => warn!("Failed to unsubscribe {} on destroy: {}", query.service_key(), e),
            }
        }
    }
}

fn validate_query(query: &Endpoint) -> Result<()> {
    let interface = query.service_interface();
    if interface.is_empty() {
        return Err(CoreError::Configuration(format!(
            "subscribe query {} names no interface (use {:?} for all)",
            query, ANY_VALUE
        )));
    }
    Ok(())
}

fn same_listener(a: &Arc<dyn NotifyListener>, b: &Arc<dyn NotifyListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Completes a oneshot on the first notification it sees
pub struct OneShotListener {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl OneShotListener {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (listener, rx)
    }
}

impl NotifyListener for OneShotListener {
    fn notify(&self, _endpoints: &[Endpoint]) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}
