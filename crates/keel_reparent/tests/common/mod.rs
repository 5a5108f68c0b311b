//! Shared helpers for the emergency reparent integration suites.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use keel_reparent::{
    EmergencyReparenter, MemoryTopology, PrimaryStatus, PromotionRule, ReplicaStatus,
    ReplicationPosition, ShardInfo, StopReplicationOutcome, StopReplicationStatus,
    TabletAgentClient, Tablet, TabletAlias, TabletType, TopologyStore,
};

pub const KEYSPACE: &str = "commerce";
pub const SHARD: &str = "-";

pub fn pos(s: &str) -> ReplicationPosition {
    s.parse().expect("parse position")
}

pub fn replica(cell: &str, uid: u32, rule: PromotionRule) -> Tablet {
    Tablet {
        alias: TabletAlias::new(cell, uid),
        hostname: format!("{cell}-host-{uid}"),
        tablet_type: TabletType::Replica,
        promotion_rule: rule,
    }
}

pub fn dead_primary(cell: &str, uid: u32) -> Tablet {
    Tablet {
        alias: TabletAlias::new(cell, uid),
        hostname: format!("{cell}-host-{uid}"),
        tablet_type: TabletType::Primary,
        promotion_rule: PromotionRule::Neutral,
    }
}

/// How a tablet's agent answers stop-replication.
#[derive(Clone, Debug)]
pub enum StopScript {
    /// Was replicating; reports executed and relay-log positions.
    Replica { executed: String, relay: String },
    /// Refuses: believes itself primary at this position.
    Primary { position: String },
    /// Hard failure (process dead, network partition).
    Error(String),
}

/// Scripted behavior for one tablet's agent.
#[derive(Clone, Debug)]
pub struct TabletScript {
    pub stop: StopScript,
    /// Artificial latency before the stop-replication response.
    pub stop_delay: Duration,
    /// Source id this tablet replicated from; records from it are never
    /// errant. Every suite writes through source `s` unless it says
    /// otherwise.
    pub source_id: String,
    pub was_running: bool,
    pub fail_set_source: bool,
    pub fail_promote: bool,
    pub fail_journal: bool,
    pub fail_wait_position: bool,
    pub fail_relay_wait: bool,
}

impl TabletScript {
    pub fn replicating(executed: &str, relay: &str) -> Self {
        Self {
            stop: StopScript::Replica {
                executed: executed.to_string(),
                relay: relay.to_string(),
            },
            stop_delay: Duration::ZERO,
            source_id: "s".to_string(),
            was_running: true,
            fail_set_source: false,
            fail_promote: false,
            fail_journal: false,
            fail_wait_position: false,
            fail_relay_wait: false,
        }
    }

    /// Caught-up replica: relay log equals the executed position.
    pub fn caught_up(position: &str) -> Self {
        Self::replicating(position, position)
    }

    /// Tablet stuck believing it is primary; refuses stop-replication and
    /// reports this position instead.
    pub fn stuck_primary(position: &str) -> Self {
        Self {
            stop: StopScript::Primary {
                position: position.to_string(),
            },
            stop_delay: Duration::ZERO,
            source_id: String::new(),
            was_running: false,
            fail_set_source: false,
            fail_promote: false,
            fail_journal: false,
            fail_wait_position: false,
            fail_relay_wait: false,
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        Self {
            stop: StopScript::Error(reason.to_string()),
            stop_delay: Duration::ZERO,
            source_id: String::new(),
            was_running: false,
            fail_set_source: true,
            fail_promote: true,
            fail_journal: true,
            fail_wait_position: true,
            fail_relay_wait: true,
        }
    }
}

/// One recorded agent call, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentCall {
    StopReplication {
        tablet: String,
    },
    WaitForRelayLogs {
        tablet: String,
    },
    PrimaryPosition {
        tablet: String,
    },
    SetSource {
        tablet: String,
        source: String,
        force_start: bool,
    },
    PromoteReplica {
        tablet: String,
        position: String,
    },
    PopulateJournal {
        tablet: String,
        action: String,
        position: String,
    },
    WaitForPosition {
        tablet: String,
        target: String,
    },
}

/// Scriptable in-process agent standing in for the per-node RPC clients.
#[derive(Default)]
pub struct FakeAgent {
    scripts: Mutex<BTreeMap<String, TabletScript>>,
    calls: Mutex<Vec<AgentCall>>,
    stop_hook: Mutex<Option<Box<dyn Fn(&str) + Send>>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, tablet: &Tablet, script: TabletScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(tablet.alias.to_string(), script);
    }

    /// Run a side effect when any tablet receives stop-replication. Used to
    /// inject topology faults (lock loss) mid-operation.
    pub fn set_stop_hook(&self, hook: impl Fn(&str) + Send + 'static) {
        *self.stop_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_source_calls(&self) -> Vec<(String, String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::SetSource {
                    tablet,
                    source,
                    force_start,
                } => Some((tablet, source, force_start)),
                _ => None,
            })
            .collect()
    }

    pub fn journal_writes(&self) -> Vec<(String, String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::PopulateJournal {
                    tablet,
                    action,
                    position,
                } => Some((tablet, action, position)),
                _ => None,
            })
            .collect()
    }

    /// Tablets that were successfully promoted, with the reported position.
    pub fn promotions(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::PromoteReplica { tablet, position } => Some((tablet, position)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn script_for(&self, tablet: &Tablet) -> Option<TabletScript> {
        self.scripts
            .lock()
            .unwrap()
            .get(&tablet.alias.to_string())
            .cloned()
    }

    /// Best known position of a tablet: the relay-log position for replicas,
    /// the self-reported position for primaries.
    fn position_of(&self, tablet: &Tablet) -> anyhow::Result<ReplicationPosition> {
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {}", tablet.alias))?;
        match script.stop {
            StopScript::Replica { relay, .. } => Ok(pos(&relay)),
            StopScript::Primary { position } => Ok(pos(&position)),
            StopScript::Error(reason) => Err(anyhow::anyhow!("{} unreachable: {reason}", tablet.alias)),
        }
    }
}

#[async_trait]
impl TabletAgentClient for FakeAgent {
    async fn stop_replication_and_get_status(
        &self,
        tablet: &Tablet,
    ) -> anyhow::Result<StopReplicationOutcome> {
        let alias = tablet.alias.to_string();
        self.record(AgentCall::StopReplication {
            tablet: alias.clone(),
        });
        if let Some(hook) = self.stop_hook.lock().unwrap().as_ref() {
            hook(&alias);
        }
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.stop_delay > Duration::ZERO {
            tokio::time::sleep(script.stop_delay).await;
        }
        match script.stop {
            StopScript::Replica { executed, relay } => {
                Ok(StopReplicationOutcome::Replica(StopReplicationStatus {
                    before: ReplicaStatus {
                        position: pos(&executed),
                        relay_log_position: pos(&relay),
                        source_id: script.source_id.clone(),
                        io_running: script.was_running,
                        sql_running: script.was_running,
                    },
                    after: ReplicaStatus {
                        position: pos(&executed),
                        relay_log_position: pos(&relay),
                        source_id: script.source_id,
                        io_running: false,
                        sql_running: false,
                    },
                }))
            }
            StopScript::Primary { position } => {
                Ok(StopReplicationOutcome::NotReplica(PrimaryStatus {
                    position: pos(&position),
                }))
            }
            StopScript::Error(reason) => Err(anyhow::anyhow!("{alias} unreachable: {reason}")),
        }
    }

    async fn wait_for_relay_logs(
        &self,
        tablet: &Tablet,
        _status: &StopReplicationStatus,
    ) -> anyhow::Result<()> {
        let alias = tablet.alias.to_string();
        self.record(AgentCall::WaitForRelayLogs {
            tablet: alias.clone(),
        });
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.fail_relay_wait {
            anyhow::bail!("{alias} failed to apply relay logs");
        }
        Ok(())
    }

    async fn primary_position(&self, tablet: &Tablet) -> anyhow::Result<ReplicationPosition> {
        self.record(AgentCall::PrimaryPosition {
            tablet: tablet.alias.to_string(),
        });
        self.position_of(tablet)
    }

    async fn set_source(
        &self,
        tablet: &Tablet,
        source: &TabletAlias,
        force_start: bool,
    ) -> anyhow::Result<()> {
        let alias = tablet.alias.to_string();
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.fail_set_source {
            anyhow::bail!("{alias} refused new source");
        }
        self.record(AgentCall::SetSource {
            tablet: alias,
            source: source.to_string(),
            force_start,
        });
        Ok(())
    }

    async fn promote_replica(&self, tablet: &Tablet) -> anyhow::Result<ReplicationPosition> {
        let alias = tablet.alias.to_string();
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.fail_promote {
            anyhow::bail!("{alias} failed to promote");
        }
        let position = self.position_of(tablet)?;
        self.record(AgentCall::PromoteReplica {
            tablet: alias.clone(),
            position: position.to_string(),
        });
        // A promoted tablet answers later stop-replication calls as primary.
        self.scripts
            .lock()
            .unwrap()
            .insert(alias, TabletScript::stuck_primary(&position.to_string()));
        Ok(position)
    }

    async fn populate_reparent_journal(
        &self,
        tablet: &Tablet,
        _time_ns: i64,
        action: &str,
        _new_primary: &TabletAlias,
        position: &ReplicationPosition,
    ) -> anyhow::Result<()> {
        let alias = tablet.alias.to_string();
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.fail_journal {
            anyhow::bail!("{alias} failed to write the reparent journal");
        }
        self.record(AgentCall::PopulateJournal {
            tablet: alias,
            action: action.to_string(),
            position: position.to_string(),
        });
        Ok(())
    }

    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        target: &ReplicationPosition,
    ) -> anyhow::Result<()> {
        let alias = tablet.alias.to_string();
        self.record(AgentCall::WaitForPosition {
            tablet: alias.clone(),
            target: target.to_string(),
        });
        let script = self
            .script_for(tablet)
            .ok_or_else(|| anyhow::anyhow!("no script for {alias}"))?;
        if script.fail_wait_position {
            anyhow::bail!("{alias} never reached {target}");
        }
        Ok(())
    }
}

/// Let residual fan-out tasks drain. The fast promotion path returns as soon
/// as one replica accepts; the rest finish in the background.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Cluster under test: topology, agent, and a reparenter wired to both.
pub struct Cluster {
    pub topo: Arc<MemoryTopology>,
    pub agent: Arc<FakeAgent>,
    pub reparenter: EmergencyReparenter,
}

/// Build a one-shard cluster from (tablet, script) pairs. The shard record's
/// primary alias is set from `previous_primary` when given.
pub fn cluster(
    tablets: Vec<(Tablet, TabletScript)>,
    previous_primary: Option<TabletAlias>,
) -> Cluster {
    let topo = Arc::new(MemoryTopology::new());
    topo.upsert_shard(ShardInfo {
        keyspace: KEYSPACE.to_string(),
        shard: SHARD.to_string(),
        primary_alias: previous_primary,
    });

    let agent = Arc::new(FakeAgent::new());
    for (tablet, script) in tablets {
        agent.script(&tablet, script);
        topo.upsert_tablet(tablet);
    }

    let reparenter = EmergencyReparenter::new(
        Arc::clone(&topo) as Arc<dyn TopologyStore>,
        Arc::clone(&agent) as Arc<dyn TabletAgentClient>,
    );
    Cluster {
        topo,
        agent,
        reparenter,
    }
}
