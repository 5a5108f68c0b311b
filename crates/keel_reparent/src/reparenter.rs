//! Emergency reparent orchestration.
//!
//! Drives the full procedure under the shard lock: collect and filter
//! candidates, catch them up, pick an intermediate source, optionally improve
//! on it, enforce the promotion constraints (undoing the choice when they
//! fail), and finally promote. The orchestrator itself is sequential; every
//! per-tablet step fans out through the executor and collector modules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::agent::{StopStatusMap, TabletAgentClient};
use crate::candidates;
use crate::catchup;
use crate::collector;
use crate::errors::ReparentError;
use crate::events::{EventDispatcher, Reparent};
use crate::executor;
use crate::topology::{PromotionRule, Tablet, TabletAlias, TopologyStore};

/// Caller-supplied knobs for one emergency reparent operation. Passed by
/// value per call; reusing an options struct across calls is fine.
#[derive(Clone, Debug)]
pub struct EmergencyReparentOptions {
    /// Hard request for a specific new primary.
    pub new_primary_alias: Option<TabletAlias>,
    /// Tablets never considered as candidates nor reconfigured.
    pub ignore_replicas: BTreeSet<TabletAlias>,
    /// Bound for every concurrent per-replica step.
    pub wait_replicas_timeout: Duration,
    /// Require the final primary to share a cell with the previous primary.
    pub prevent_cross_cell_promotion: bool,
}

impl Default for EmergencyReparentOptions {
    fn default() -> Self {
        Self {
            new_primary_alias: None,
            ignore_replicas: BTreeSet::new(),
            wait_replicas_timeout: Duration::from_secs(30),
            prevent_cross_cell_promotion: false,
        }
    }
}

/// Run counters, incremented exactly once per operation.
#[derive(Debug, Default)]
pub struct ReparentStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReparentStatsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ReparentStats {
    pub fn snapshot(&self) -> ReparentStatsSnapshot {
        ReparentStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Performs emergency reparent operations against a topology store and the
/// per-tablet agents.
pub struct EmergencyReparenter {
    topo: Arc<dyn TopologyStore>,
    agent: Arc<dyn TabletAgentClient>,
    dispatcher: EventDispatcher,
    stats: Arc<ReparentStats>,
}

impl EmergencyReparenter {
    pub fn new(topo: Arc<dyn TopologyStore>, agent: Arc<dyn TabletAgentClient>) -> Self {
        Self {
            topo,
            agent,
            dispatcher: EventDispatcher::default(),
            stats: Arc::new(ReparentStats::default()),
        }
    }

    /// Subscribe to `Reparent` progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<Reparent> {
        self.dispatcher.subscribe()
    }

    pub fn stats(&self) -> ReparentStatsSnapshot {
        self.stats.snapshot()
    }

    fn lock_action(new_primary: Option<&TabletAlias>) -> String {
        match new_primary {
            Some(alias) => format!("EmergencyReparentShard({alias})"),
            None => "EmergencyReparentShard".to_string(),
        }
    }

    /// Run the full emergency reparent procedure for one shard.
    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        opts: EmergencyReparentOptions,
    ) -> Result<Reparent, ReparentError> {
        let action = Self::lock_action(opts.new_primary_alias.as_ref());
        let lock = self
            .topo
            .lock_shard(keyspace, shard, &action)
            .await
            .map_err(|source| ReparentError::Step {
                step: "acquire shard lock",
                source,
            })?;

        let mut ev = Reparent::default();
        self.dispatcher.update(&mut ev, "starting emergency reparent");

        let mut res = self
            .reparent_shard_locked(&mut ev, keyspace, shard, &opts, &action)
            .await;

        // Lock release, counter increment, and terminal event dispatch happen
        // exactly once on every exit path through this tail.
        if let Err(err) = self.topo.unlock_shard(lock).await {
            tracing::warn!(error = ?err, "failed to release shard lock");
            if res.is_ok() {
                res = Err(ReparentError::Step {
                    step: "release shard lock",
                    source: err,
                });
            }
        }
        match &res {
            Ok(()) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.dispatcher.update(&mut ev, "finished emergency reparent");
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.dispatcher
                    .update(&mut ev, format!("failed emergency reparent: {err}"));
            }
        }
        res.map(|()| ev)
    }

    async fn reparent_shard_locked(
        &self,
        ev: &mut Reparent,
        keyspace: &str,
        shard: &str,
        opts: &EmergencyReparentOptions,
        action: &str,
    ) -> Result<(), ReparentError> {
        tracing::info!(keyspace, shard, "starting emergency reparent");
        self.stats.started.fetch_add(1, Ordering::Relaxed);

        let shard_info = self
            .topo
            .get_shard(keyspace, shard)
            .await
            .map_err(|source| ReparentError::Step {
                step: "read shard record",
                source,
            })?;
        ev.shard_info = Some(shard_info.clone());

        // The previous primary, when known, anchors the cell preference and
        // is the target of any undo.
        let prev_primary = match &shard_info.primary_alias {
            Some(alias) => Some(self.topo.get_tablet(alias).await.map_err(|source| {
                ReparentError::Step {
                    step: "read previous primary record",
                    source,
                }
            })?),
            None => None,
        };

        self.dispatcher.update(ev, "reading all tablets");
        let tablet_map = self
            .topo
            .get_tablet_map_for_shard(keyspace, shard)
            .await
            .map_err(|source| ReparentError::Step {
                step: "read tablet map",
                source,
            })?;

        let (stop_status, primary_status) = collector::stop_replication_and_build_status_maps(
            &self.agent,
            &tablet_map,
            &opts.ignore_replicas,
            opts.wait_replicas_timeout,
        )
        .await?;

        self.check_lock(keyspace, shard).await?;

        let valid = candidates::find_valid_candidates(&stop_status, &primary_status);
        let valid = candidates::restrict_valid_candidates(valid, &tablet_map, &opts.ignore_replicas)?;

        catchup::wait_for_all_relay_logs(
            &self.agent,
            &valid,
            &tablet_map,
            &stop_status,
            opts.wait_replicas_timeout,
        )
        .await?;

        let (intermediate, valid_tablets) =
            candidates::find_most_advanced(prev_primary.as_ref(), &valid, &tablet_map, opts)?;
        tracing::info!(tablet = %intermediate.alias, "intermediate source selected");

        let is_ideal = candidates::intermediate_is_ideal(
            &intermediate,
            prev_primary.as_ref(),
            &valid_tablets,
            &tablet_map,
            opts,
        )?;
        tracing::info!(ideal = is_ideal, "intermediate source evaluated");

        self.check_lock(keyspace, shard).await?;

        let mut new_primary = intermediate.clone();
        if !is_ideal {
            // Funnel everyone into the intermediate first, then look for a
            // better final primary among the tablets that followed.
            let accepted = executor::promote_intermediate(
                &self.agent,
                &self.dispatcher,
                ev,
                &intermediate,
                &tablet_map,
                &stop_status,
                opts,
                action,
            )
            .await?;

            let better = candidates::identify_primary_candidate(
                &intermediate,
                prev_primary.as_ref(),
                &accepted,
                &tablet_map,
                opts,
            )?;
            if better.alias != intermediate.alias {
                catchup::wait_for_catch_up(
                    &self.agent,
                    &intermediate,
                    &better,
                    opts.wait_replicas_timeout,
                )
                .await?;
                new_primary = better;
            }
        }

        if let Some(constraint) = check_constraints(&new_primary, prev_primary.as_ref(), opts) {
            tracing::error!(error = %constraint, "constraint failure, undoing promotion");
            let Some(prev) = prev_primary else {
                return Err(ReparentError::CompensationFailed {
                    undo: Box::new(ReparentError::NoPreviousPrimary),
                    constraint: Box::new(constraint),
                });
            };
            // Whatever the undo does, the operation fails: with the
            // constraint error alone when the undo promotion succeeded, with
            // both errors joined when it did not.
            return Err(
                match self
                    .promote_new_primary(ev, &prev, opts, &tablet_map, &stop_status, action)
                    .await
                {
                    Ok(()) => {
                        ev.new_primary = Some(prev.clone());
                        constraint
                    }
                    Err(undo) => ReparentError::CompensationFailed {
                        undo: Box::new(undo),
                        constraint: Box::new(constraint),
                    },
                },
            );
        }

        self.promote_new_primary(ev, &new_primary, opts, &tablet_map, &stop_status, action)
            .await?;
        ev.new_primary = Some(new_primary);
        Ok(())
    }

    async fn check_lock(&self, keyspace: &str, shard: &str) -> Result<(), ReparentError> {
        self.topo
            .check_shard_locked(keyspace, shard)
            .await
            .map_err(|source| ReparentError::LockLost {
                keyspace: keyspace.to_string(),
                shard: shard.to_string(),
                source,
            })
    }

    async fn promote_new_primary(
        &self,
        ev: &mut Reparent,
        new_primary: &Tablet,
        opts: &EmergencyReparentOptions,
        tablet_map: &BTreeMap<String, Tablet>,
        stop_status: &StopStatusMap,
        action: &str,
    ) -> Result<(), ReparentError> {
        tracing::info!(tablet = %new_primary.alias, "starting promotion of the new primary");
        self.agent
            .promote_replica(new_primary)
            .await
            .map_err(|source| ReparentError::Step {
                step: "promote new primary",
                source,
            })?;

        executor::reparent_replicas(
            &self.agent,
            &self.dispatcher,
            ev,
            new_primary,
            tablet_map,
            stop_status,
            opts,
            action,
            false,
            true,
        )
        .await?;
        Ok(())
    }
}

/// Cell and promotion-rule constraints on the elected primary.
fn check_constraints(
    new_primary: &Tablet,
    prev_primary: Option<&Tablet>,
    opts: &EmergencyReparentOptions,
) -> Option<ReparentError> {
    if opts.prevent_cross_cell_promotion {
        if let Some(prev) = prev_primary {
            if new_primary.alias.cell != prev.alias.cell {
                return Some(ReparentError::CrossCellConstraint {
                    alias: new_primary.alias.clone(),
                });
            }
        }
    }
    if new_primary.promotion_rule == PromotionRule::MustNot {
        return Some(ReparentError::PromotionRuleConstraint {
            alias: new_primary.alias.clone(),
        });
    }
    None
}
