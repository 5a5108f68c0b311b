//! Emergency reparent orchestration for sharded replication groups.
//!
//! A shard is one primary plus replicas streaming its change log. When the
//! primary dies or becomes unreachable, [`EmergencyReparenter::reparent_shard`]
//! selects a surviving replica, promotes it, and reconfigures every other
//! replica to stream from it, all under a named exclusive shard lock and
//! with bounded per-replica wait semantics.
//!
//! The crate owns the orchestration only. The topology store and per-tablet
//! agents are collaborator traits ([`TopologyStore`], [`TabletAgentClient`]);
//! an in-memory topology ships for tests and embedding.

pub mod agent;
pub mod candidates;
pub mod catchup;
pub mod collector;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fanout;
pub mod position;
pub mod reparenter;
pub mod topology;

pub use agent::{
    PrimaryStatus, PrimaryStatusMap, ReplicaStatus, StopReplicationOutcome, StopReplicationStatus,
    StopStatusMap, TabletAgentClient,
};
pub use errors::{ErrorCode, ReparentError};
pub use events::{EventDispatcher, Reparent};
pub use position::ReplicationPosition;
pub use reparenter::{
    EmergencyReparentOptions, EmergencyReparenter, ReparentStats, ReparentStatsSnapshot,
};
pub use topology::{
    MemoryTopology, PromotionRule, ShardInfo, ShardLock, Tablet, TabletAlias, TabletType,
    TopologyStore,
};
