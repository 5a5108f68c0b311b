//! Per-tablet agent client seam.
//!
//! Every node runs an agent that owns its local database process. The
//! orchestrator talks to agents through this capability interface, one method
//! per operation. Implementations are transport-specific; errors cross the
//! seam as `anyhow::Error` and are classified by the orchestration core.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::position::ReplicationPosition;
use crate::topology::{Tablet, TabletAlias};

/// Replication state of one tablet at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Executed position.
    pub position: ReplicationPosition,
    /// Position fetched into the local relay log, possibly ahead of
    /// `position` until the applier catches up.
    pub relay_log_position: ReplicationPosition,
    /// Source id of the server this tablet was replicating from. Records
    /// originating here are never errant.
    pub source_id: String,
    pub io_running: bool,
    pub sql_running: bool,
}

/// Snapshot taken around a stop-replication call: state just before the stop
/// and the settled state after it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReplicationStatus {
    pub before: ReplicaStatus,
    pub after: ReplicaStatus,
}

impl StopReplicationStatus {
    /// Whether replication was running before the stop. Drives `force_start`
    /// when the tablet is later pointed at a new source.
    pub fn was_running(&self) -> bool {
        self.before.io_running && self.before.sql_running
    }
}

/// Status reported by a tablet that refused stop-replication because it
/// believes itself to be primary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryStatus {
    pub position: ReplicationPosition,
}

/// The two success shapes of a stop-replication call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReplicationOutcome {
    /// The tablet was replicating and has now stopped.
    Replica(StopReplicationStatus),
    /// The tablet is (or is stuck believing it is) primary.
    NotReplica(PrimaryStatus),
}

/// Stop-replication results for tablets that were actually replicating,
/// keyed by alias string.
pub type StopStatusMap = BTreeMap<String, StopReplicationStatus>;

/// Primary self-reports for tablets that refused stop-replication.
pub type PrimaryStatusMap = BTreeMap<String, PrimaryStatus>;

/// Capability interface over the per-node agent RPCs.
#[async_trait]
pub trait TabletAgentClient: Send + Sync {
    /// Stop replication and report status, or report primary status when the
    /// tablet is not a replica.
    async fn stop_replication_and_get_status(
        &self,
        tablet: &Tablet,
    ) -> anyhow::Result<StopReplicationOutcome>;

    /// Block until the tablet has applied every change record already fetched
    /// into its relay log.
    async fn wait_for_relay_logs(
        &self,
        tablet: &Tablet,
        status: &StopReplicationStatus,
    ) -> anyhow::Result<()>;

    /// Current position of a tablet acting as primary.
    async fn primary_position(&self, tablet: &Tablet) -> anyhow::Result<ReplicationPosition>;

    /// Point the tablet at a new replication source. `force_start` restarts
    /// replication even though it was stopped.
    async fn set_source(
        &self,
        tablet: &Tablet,
        source: &TabletAlias,
        force_start: bool,
    ) -> anyhow::Result<()>;

    /// Promote the tablet to primary: switch type, configure durability
    /// acknowledgements, set read-write, flush the change log. Returns the
    /// position at promotion time.
    async fn promote_replica(&self, tablet: &Tablet) -> anyhow::Result<ReplicationPosition>;

    /// Write a reparent journal row on the new primary so late joiners can
    /// recognize the reparent event.
    async fn populate_reparent_journal(
        &self,
        tablet: &Tablet,
        time_ns: i64,
        action: &str,
        new_primary: &TabletAlias,
        position: &ReplicationPosition,
    ) -> anyhow::Result<()>;

    /// Block until the tablet's executed position reaches `target`.
    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        target: &ReplicationPosition,
    ) -> anyhow::Result<()>;
}
