//! Load balancing strategies for picking one provider per call

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::debug;
use traffic_api::LoadBalanceMode;
use traffic_core::endpoint::LOADBALANCE_KEY;
use traffic_core::Endpoint;

/// How long a selection sticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionScope {
    /// Select anew for every call
    #[default]
    Request,
    /// Reuse the previous pick while it is still a candidate
    Connection,
}

/// Mode overrides at method, interface and global level
#[derive(Debug, Default)]
pub struct BalancerSettings {
    global: RwLock<LoadBalanceMode>,
    interfaces: DashMap<String, LoadBalanceMode>,
    methods: DashMap<(String, String), LoadBalanceMode>,
}

impl BalancerSettings {
    pub fn new(global: LoadBalanceMode) -> Self {
        Self {
            global: RwLock::new(global),
            ..Self::default()
        }
    }

    pub fn set_global(&self, mode: LoadBalanceMode) {
        *self.global.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn global(&self) -> LoadBalanceMode {
        *self.global.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_interface(&self, interface: &str, mode: LoadBalanceMode) {
        self.interfaces.insert(interface.to_string(), mode);
    }

    pub fn interface(&self, interface: &str) -> Option<LoadBalanceMode> {
        self.interfaces.get(interface).map(|m| *m)
    }

    pub fn set_method(&self, interface: &str, method: &str, mode: LoadBalanceMode) {
        self.methods
            .insert((interface.to_string(), method.to_string()), mode);
    }

    pub fn method(&self, interface: &str, method: &str) -> Option<LoadBalanceMode> {
        self.methods
            .get(&(interface.to_string(), method.to_string()))
            .map(|m| *m)
    }

    /// Resolve the mode for a call: method, then interface, then global.
    /// Endpoint params (`<method>.loadbalance`, `loadbalance`) on the first
    /// candidate sit below the matching explicit setting.
    pub fn resolve(&self, interface: &str, method: &str, candidates: &[Endpoint]) -> LoadBalanceMode {
        let advertised = |key: &str| {
            candidates
                .first()
                .and_then(|e| e.param(key))
                .and_then(|v| v.parse::<LoadBalanceMode>().ok())
        };

        self.method(interface, method)
            .or_else(|| advertised(&format!("{}.{}", method, LOADBALANCE_KEY)))
            .or_else(|| self.interface(interface))
            .or_else(|| advertised(LOADBALANCE_KEY))
            .unwrap_or_else(|| self.global())
    }
}

/// First candidate in canonical string order
pub fn pick_first(candidates: &[Endpoint]) -> Option<&Endpoint> {
    candidates.iter().min_by_key(|e| e.to_string())
}

/// Weighted server entry of one membership snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedEntry {
    pub key: String,
    pub static_weight: i64,
    pub current_weight: i64,
}

impl WeightedEntry {
    pub fn new(key: impl Into<String>, weight: u32) -> Self {
        Self {
            key: key.into(),
            static_weight: i64::from(weight),
            current_weight: 0,
        }
    }
}

/// One step of smooth weighted round robin; returns the winning index
pub fn select_best(entries: &mut [WeightedEntry]) -> Option<usize> {
    let mut total = 0;
    let mut best: Option<usize> = None;
    for idx in 0..entries.len() {
        let entry = &mut entries[idx];
        entry.current_weight += entry.static_weight;
        total += entry.static_weight;
        match best {
            Some(b) if entries[b].current_weight >= entries[idx].current_weight => {}
            _ => best = Some(idx),
        }
    }
    if let Some(b) = best {
        entries[b].current_weight -= total;
    }
    best
}

#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    members: BTreeSet<String>,
    entries: Vec<WeightedEntry>,
}

impl Snapshot {
    fn refresh(&mut self, service: &str, candidates: &[Endpoint]) {
        let members: BTreeSet<String> = candidates.iter().map(Endpoint::address).collect();
        if members != self.members {
            let mut seen = BTreeSet::new();
            self.entries = candidates
                .iter()
                .filter(|e| seen.insert(e.address()))
                .map(|e| WeightedEntry::new(e.address(), e.weight()))
                .collect();
            self.members = members;
            self.generation += 1;
            debug!(
                "Rebuilt weighted round robin for {} with {} member(s), generation {}",
                service,
                self.entries.len(),
                self.generation
            );
            return;
        }

        let weights: HashMap<String, u32> = candidates
            .iter()
            .map(|e| (e.address(), e.weight()))
            .collect();
        for entry in &mut self.entries {
            if let Some(weight) = weights.get(&entry.key) {
                entry.static_weight = i64::from(*weight);
            }
        }
    }
}

/// Smooth weighted round robin state, one snapshot per service
#[derive(Debug, Default)]
pub struct SmoothWeightedRoundRobin {
    snapshots: DashMap<String, Snapshot>,
}

impl SmoothWeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<'a>(&self, service: &str, candidates: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if candidates.is_empty() {
            return None;
        }

        let mut snapshot = self.snapshots.entry(service.to_string()).or_default();
        snapshot.refresh(service, candidates);
        let winner = select_best(&mut snapshot.entries)?;
        let key = &snapshot.entries[winner].key;
        candidates.iter().find(|e| &e.address() == key)
    }

    /// Membership generation of a service, if it has been balanced yet
    pub fn generation(&self, service: &str) -> Option<u64> {
        self.snapshots.get(service).map(|s| s.generation)
    }
}

/// Load balancer resolving a mode per call and applying it
pub struct LoadBalancer {
    settings: BalancerSettings,
    round_robin: SmoothWeightedRoundRobin,
    sticky: DashMap<String, String>,
}

impl LoadBalancer {
    pub fn new(settings: BalancerSettings) -> Self {
        Self {
            settings,
            round_robin: SmoothWeightedRoundRobin::new(),
            sticky: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &BalancerSettings {
        &self.settings
    }

    pub fn round_robin(&self) -> &SmoothWeightedRoundRobin {
        &self.round_robin
    }

    /// Select one candidate for `consumer` calling `method`
    pub fn select<'a>(
        &self,
        consumer: &Endpoint,
        method: &str,
        candidates: &'a [Endpoint],
        scope: SelectionScope,
    ) -> Option<&'a Endpoint> {
        if candidates.is_empty() {
            return None;
        }
        let service = consumer.service_key();

        if scope == SelectionScope::Connection {
            if let Some(previous) = self.sticky.get(&service) {
                if let Some(found) = candidates.iter().find(|e| e.address() == *previous) {
                    return Some(found);
                }
            }
        }

        let mode = self
            .settings
            .resolve(consumer.service_interface(), method, candidates);
        let chosen = match mode {
            LoadBalanceMode::PickFirst => pick_first(candidates),
            LoadBalanceMode::RoundRobin => self.round_robin.select(&service, candidates),
        }?;
        debug!("Selected {} for {}#{} using {}", chosen.address(), service, method, mode);

        if scope == SelectionScope::Connection {
            self.sticky.insert(service, chosen.address());
        }
        Some(chosen)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancerSettings::default())
    }
}
