//! banter-db: routed database access for the banter message store
//!
//! Splits traffic between the primary and a read replica based on
//! consistency requirements, per-endpoint policy, measured replication
//! lag, and a circuit breaker, with keyset pagination and batched
//! aggregates layered on top.

pub mod breaker;
pub mod config;
pub mod error;
pub mod lag;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod query;
pub mod router;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, ForcedState};
pub use config::DbConfig;
pub use error::{DbError, Result};
pub use lag::{LagMonitor, LagMonitorHandle, LagProbe, LagReading, LagSample, PgLagProbe, ReplicaHealth};
pub use metrics::{EndpointRouteCounts, MetricsSink, MetricsSnapshot, RouteTarget, RoutingMetrics};
pub use policy::{Endpoint, RoutingPolicy};
pub use pool::{PoolKind, PoolStatus};
pub use query::{
    latest_messages, unread_counts, Cursor, KeysetPage, KeysetPaginator, MessageSummary, SortOrder,
};
pub use router::{Db, DbOptions, DbStatus, ReadOptions};
