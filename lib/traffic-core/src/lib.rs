//! Service discovery core
//!
//! This library provides:
//! - Endpoint descriptors with a canonical string form
//! - A local registry with subscription fan-out and lookup
//! - A failback registry persisted through a coordination store

pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod store;
pub mod store_registry;

pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use registry::{NotifyListener, OneShotListener, Registry, RegistryService};
pub use store::{CoordinationStore, MemoryStore, StoreError, StoreState};
pub use store_registry::{RegistryOptions, StoreRegistry};
