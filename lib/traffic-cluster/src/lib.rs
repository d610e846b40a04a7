//! Per-call traffic management
//!
//! Routing, load balancing, admission control and connection pooling on top
//! of the registry in `traffic-core`.

pub mod admission;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod load_balancer;
pub mod metrics;
pub mod pool;
pub mod router;

pub use admission::{
    Clock, ConcurrencyLimiter, ConcurrencyPermit, ManualClock, RequestRateLimiter, SystemClock,
};
pub use config::apply_config;
pub use directory::ServiceDirectory;
pub use dispatcher::CallDispatcher;
pub use error::{AdmissionKind, ClusterError, Result};
pub use load_balancer::{BalancerSettings, LoadBalancer, SelectionScope, SmoothWeightedRoundRobin};
pub use metrics::TrafficMetrics;
pub use pool::{AddressSet, Connection, ConnectionFactory, ConnectionPool, PooledConnection};
pub use router::{ConditionRouter, RouterChain};
