//! Stop-replication fan-out.
//!
//! First data-gathering phase of an emergency reparent: stop replication on
//! every member of the shard concurrently and split the responses into a
//! stop-replication-status map (tablets that were replicating) and a
//! primary-status map (tablets that refused because they believe they are
//! primary).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{PrimaryStatusMap, StopReplicationOutcome, StopStatusMap, TabletAgentClient};
use crate::errors::ReparentError;
use crate::fanout::FanoutGroup;
use crate::topology::{Tablet, TabletAlias};

const STEP: &str = "stop replication and build status maps";

/// Stop replication on every non-ignored tablet and build the status maps.
/// The step tolerates individual tablet failures as long as at least one
/// tablet produced a usable response; the candidate filter decides the rest.
pub async fn stop_replication_and_build_status_maps(
    agent: &Arc<dyn TabletAgentClient>,
    tablet_map: &BTreeMap<String, Tablet>,
    ignore: &BTreeSet<TabletAlias>,
    timeout: Duration,
) -> Result<(StopStatusMap, PrimaryStatusMap), ReparentError> {
    let targets: Vec<&Tablet> = tablet_map
        .values()
        .filter(|tablet| !ignore.contains(&tablet.alias))
        .collect();
    if targets.is_empty() {
        return Ok((StopStatusMap::new(), PrimaryStatusMap::new()));
    }

    let stop_map = Arc::new(Mutex::new(StopStatusMap::new()));
    let primary_map = Arc::new(Mutex::new(PrimaryStatusMap::new()));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(targets.len());
    let group = FanoutGroup::at_least_one(targets.len());

    for tablet in targets {
        let agent = Arc::clone(agent);
        let tablet = tablet.clone();
        let stop_map = Arc::clone(&stop_map);
        let primary_map = Arc::clone(&primary_map);
        let cancel = cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let alias = tablet.alias.to_string();
            let res = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(anyhow::anyhow!("stop replication cancelled for {alias}"))
                }
                res = tokio::time::timeout(
                    timeout,
                    agent.stop_replication_and_get_status(&tablet),
                ) => match res {
                    Ok(Ok(StopReplicationOutcome::Replica(status))) => {
                        tracing::debug!(tablet = %alias, "replication stopped");
                        // Recover the guard on poison: a panicked sibling
                        // task leaves the map itself intact.
                        stop_map
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(alias, status);
                        Ok(())
                    }
                    Ok(Ok(StopReplicationOutcome::NotReplica(status))) => {
                        tracing::info!(
                            tablet = %alias,
                            "tablet reports itself primary, keeping its primary status"
                        );
                        primary_map
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(alias, status);
                        Ok(())
                    }
                    Ok(Err(err)) => {
                        Err(err.context(format!("stop replication failed on {alias}")))
                    }
                    Err(_) => Err(anyhow::anyhow!("stop replication timed out on {alias}")),
                },
            };
            let _ = tx.send(res).await;
        });
    }
    drop(tx);

    let Some(outcome) = group.wait_until(timeout, &cancel, &mut rx).await else {
        return Err(ReparentError::DeadlineExceeded { step: STEP });
    };
    if !group.satisfied(&outcome) {
        return Err(ReparentError::Step {
            step: STEP,
            source: anyhow::anyhow!(outcome.error_summary()),
        });
    }
    for err in &outcome.errors {
        tracing::warn!(error = ?err, "tablet ignored after stop-replication failure");
    }

    let stop_map = Arc::try_unwrap(stop_map)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_else(|shared| {
            shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        });
    let primary_map = Arc::try_unwrap(primary_map)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_else(|shared| {
            shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        });
    Ok((stop_map, primary_map))
}
