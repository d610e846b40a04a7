//! Coordination store boundary
//!
//! The registry persists registrations and watches membership through a
//! ZooKeeper-like store: hierarchical paths, ephemeral nodes, child watches
//! and session state callbacks. `MemoryStore` is an in-process implementation
//! used by tests and the agent binary.

use crate::CoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NoNode(String),

    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::CoordinationStore(err.to_string())
    }
}

/// Session state transitions reported by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Connected,
    Disconnected,
    Reconnected,
}

/// Current children of a watched path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildEvent {
    pub path: String,
    pub children: Vec<String>,
}

/// Handle for removing a child watch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create a node, creating missing parents as persistent nodes
    async fn create(&self, path: &str, ephemeral: bool) -> StoreResult<()>;

    /// Delete a node and everything below it
    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Register a persistent child watch and return the current children
    async fn watch_children(
        &self,
        path: &str,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> StoreResult<(WatchId, Vec<String>)>;

    async fn unwatch(&self, id: WatchId);

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> StoreResult<()>;

    /// Subscribe to session state transitions
    async fn watch_state(&self, events: mpsc::UnboundedSender<StoreState>);
}

#[derive(Debug, Default)]
struct Node {
    ephemeral: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<WatchId, (String, mpsc::UnboundedSender<ChildEvent>)>,
    state_listeners: Vec<mpsc::UnboundedSender<StoreState>>,
    offline: bool,
}

impl MemoryState {
    fn ensure_online(&self, path: &str) -> StoreResult<()> {
        if self.offline {
            Err(StoreError::Unavailable(format!("store offline while accessing {}", path)))
        } else {
            Ok(())
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_children_changed(&mut self, path: &str) {
        let children = self.children(path);
        self.watches.retain(|id, (watched, sender)| {
            if watched.as_str() != path {
                return true;
            }
            let delivered = sender
                .send(ChildEvent {
                    path: path.to_string(),
                    children: children.clone(),
                })
                .is_ok();
            if !delivered {
                debug!("Dropping closed child watch {:?} on {}", id, path);
            }
            delivered
        });
    }

    fn fire_state(&mut self, state: StoreState) {
        self.state_listeners.retain(|sender| sender.send(state).is_ok());
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(StoreError::NoNode(format!("invalid path {:?}", path)));
    }
    Ok(())
}

/// In-process coordination store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    next_watch: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; going offline reports `Disconnected`, coming back `Reconnected`
    pub async fn set_online(&self, online: bool) {
        let mut state = self.state.write().await;
        if state.offline == !online {
            return;
        }
        state.offline = !online;
        if online {
            info!("Memory store back online");
            state.fire_state(StoreState::Reconnected);
        } else {
            info!("Memory store going offline");
            state.fire_state(StoreState::Disconnected);
        }
    }

    /// Drop every ephemeral node as a lost session would, then report reconnection
    pub async fn expire_session(&self) {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        info!("Expiring session, removing {} ephemeral nodes", expired.len());
        state.fire_state(StoreState::Disconnected);
        for path in &expired {
            state.nodes.remove(path);
        }
        for path in &expired {
            if let Some(parent) = parent_of(path) {
                state.fire_children_changed(parent);
            }
        }
        state.fire_state(StoreState::Reconnected);
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.state.read().await.nodes.contains_key(path)
    }

    pub async fn is_ephemeral(&self, path: &str) -> Option<bool> {
        self.state.read().await.nodes.get(path).map(|n| n.ephemeral)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create(&self, path: &str, ephemeral: bool) -> StoreResult<()> {
        validate_path(path)?;
        let mut state = self.state.write().await;
        state.ensure_online(path)?;
        if state.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let mut missing = Vec::new();
        let mut cursor = parent_of(path);
        while let Some(parent) = cursor {
            if parent == "/" || state.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent_of(parent);
        }
        for parent in missing.iter().rev() {
            state.nodes.insert(parent.clone(), Node::default());
            if let Some(grandparent) = parent_of(parent) {
                state.fire_children_changed(grandparent);
            }
        }

        state.nodes.insert(
            path.to_string(),
            Node {
                ephemeral,
                data: Vec::new(),
            },
        );
        if let Some(parent) = parent_of(path) {
            state.fire_children_changed(parent);
        }
        debug!("Created {} node {}", if ephemeral { "ephemeral" } else { "persistent" }, path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut state = self.state.write().await;
        state.ensure_online(path)?;
        if state.nodes.remove(path).is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        state.nodes.retain(|key, _| !key.starts_with(&prefix));
        if let Some(parent) = parent_of(path) {
            state.fire_children_changed(parent);
        }
        debug!("Deleted node {}", path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        state.ensure_online(path)?;
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(state.children(path))
    }

    async fn watch_children(
        &self,
        path: &str,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> StoreResult<(WatchId, Vec<String>)> {
        let mut state = self.state.write().await;
        state.ensure_online(path)?;
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        state.watches.insert(id, (path.to_string(), events));
        Ok((id, state.children(path)))
    }

    async fn unwatch(&self, id: WatchId) {
        self.state.write().await.watches.remove(&id);
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        let state = self.state.read().await;
        state.ensure_online(path)?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.ensure_online(path)?;
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                Ok(())
            }
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn watch_state(&self, events: mpsc::UnboundedSender<StoreState>) {
        let mut state = self.state.write().await;
        let current = if state.offline {
            StoreState::Disconnected
        } else {
            StoreState::Connected
        };
        if events.send(current).is_ok() {
            state.state_listeners.push(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_makes_parents() {
        let store = MemoryStore::new();
        store.create("/rpc/svc/providers/a", true).await.unwrap();
        assert!(store.exists("/rpc").await);
        assert!(store.exists("/rpc/svc/providers").await);
        assert_eq!(store.is_ephemeral("/rpc/svc").await, Some(false));
        assert_eq!(store.is_ephemeral("/rpc/svc/providers/a").await, Some(true));
        assert_eq!(store.get_children("/rpc/svc/providers").await.unwrap(), vec!["a".to_string()]);
        assert_eq!(store.get_children("/").await.unwrap(), vec!["rpc".to_string()]);
    }

    #[tokio::test]
    async fn test_create_existing_and_delete_missing() {
        let store = MemoryStore::new();
        store.create("/a", false).await.unwrap();
        assert_eq!(store.create("/a", false).await, Err(StoreError::NodeExists("/a".to_string())));
        assert_eq!(store.delete("/b").await, Err(StoreError::NoNode("/b".to_string())));
        assert!(store.get_children("/missing").await.is_err());
        assert!(store.create("relative", false).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryStore::new();
        store.create("/a/b/c", false).await.unwrap();
        store.delete("/a/b").await.unwrap();
        assert!(!store.exists("/a/b/c").await);
        assert!(store.get_children("/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_child_watch_fires_on_changes() {
        let store = MemoryStore::new();
        store.create("/svc", false).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, children) = store.watch_children("/svc", tx).await.unwrap();
        assert!(children.is_empty());

        store.create("/svc/one", true).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/svc");
        assert_eq!(event.children, vec!["one".to_string()]);

        store.delete("/svc/one").await.unwrap();
        assert!(rx.recv().await.unwrap().children.is_empty());

        store.unwatch(id).await;
        store.create("/svc/two", true).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_round_trip() {
        let store = MemoryStore::new();
        store.create("/cfg", false).await.unwrap();
        store.set_data("/cfg", b"weight=200".to_vec()).await.unwrap();
        assert_eq!(store.get_data("/cfg").await.unwrap(), b"weight=200".to_vec());
        assert!(store.set_data("/nope", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_and_reconnect_states() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.watch_state(tx).await;
        assert_eq!(rx.recv().await, Some(StoreState::Connected));

        store.set_online(false).await;
        assert_eq!(rx.recv().await, Some(StoreState::Disconnected));
        assert!(matches!(store.create("/x", false).await, Err(StoreError::Unavailable(_))));

        store.set_online(true).await;
        assert_eq!(rx.recv().await, Some(StoreState::Reconnected));
        assert!(store.create("/x", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_expire_session_drops_ephemerals() {
        let store = MemoryStore::new();
        store.create("/svc/eph", true).await.unwrap();
        store.create("/svc/per", false).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.watch_state(tx).await;
        rx.recv().await;

        store.expire_session().await;
        assert!(!store.exists("/svc/eph").await);
        assert!(store.exists("/svc/per").await);
        assert_eq!(rx.recv().await, Some(StoreState::Disconnected));
        assert_eq!(rx.recv().await, Some(StoreState::Reconnected));
    }
}
