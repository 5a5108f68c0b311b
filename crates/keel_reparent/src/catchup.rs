//! Relay-log catch-up control.
//!
//! Before positions are compared, every surviving candidate must finish
//! applying the change records it had already fetched locally. Tablets that
//! were never replicating (the former primary, or a tablet stuck believing it
//! is primary) have no relay logs and are skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{StopStatusMap, TabletAgentClient};
use crate::candidates::ValidCandidateMap;
use crate::errors::ReparentError;
use crate::fanout::FanoutGroup;
use crate::topology::Tablet;

const RELAY_STEP: &str = "wait for relay logs to apply";
const CATCHUP_STEP: &str = "wait for final candidate to catch up";

/// Wait, bounded by `timeout`, for every candidate with a stop-replication
/// status to apply its relay logs. All waiters must succeed.
pub async fn wait_for_all_relay_logs(
    agent: &Arc<dyn TabletAgentClient>,
    candidates: &ValidCandidateMap,
    tablet_map: &BTreeMap<String, Tablet>,
    stop_status: &StopStatusMap,
    timeout: Duration,
) -> Result<(), ReparentError> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(candidates.len().max(1));
    let mut waiters = 0usize;

    for alias in candidates.keys() {
        let Some(status) = stop_status.get(alias) else {
            tracing::info!(
                tablet = %alias,
                "candidate was not replicating, skipping relay log wait"
            );
            continue;
        };
        let Some(tablet) = tablet_map.get(alias) else {
            return Err(ReparentError::Inconsistent {
                alias: alias.clone(),
            });
        };

        let agent = Arc::clone(agent);
        let tablet = tablet.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        waiters += 1;
        tokio::spawn(async move {
            let alias = tablet.alias.to_string();
            let res = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(anyhow::anyhow!("relay log wait cancelled for {alias}"))
                }
                res = tokio::time::timeout(
                    timeout,
                    agent.wait_for_relay_logs(&tablet, &status),
                ) => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        Err(err.context(format!("relay log wait failed on {alias}")))
                    }
                    Err(_) => Err(anyhow::anyhow!("relay log wait timed out on {alias}")),
                },
            };
            let _ = tx.send(res).await;
        });
    }
    drop(tx);

    if waiters == 0 {
        return Ok(());
    }

    let group = FanoutGroup::all_required(waiters);
    let Some(outcome) = group.wait_until(timeout, &cancel, &mut rx).await else {
        return Err(ReparentError::DeadlineExceeded { step: RELAY_STEP });
    };
    if !group.satisfied(&outcome) {
        return Err(ReparentError::Step {
            step: RELAY_STEP,
            source: anyhow::anyhow!(outcome.error_summary()),
        });
    }
    Ok(())
}

/// Wait for `waiter` to reach the current primary position of `source`. Used
/// when the chosen final primary differs from the intermediate.
pub async fn wait_for_catch_up(
    agent: &Arc<dyn TabletAgentClient>,
    source: &Tablet,
    waiter: &Tablet,
    timeout: Duration,
) -> Result<(), ReparentError> {
    tracing::info!(
        source = %source.alias,
        waiter = %waiter.alias,
        "waiting for final candidate to catch up to the intermediate source"
    );
    let target = tokio::time::timeout(timeout, agent.primary_position(source))
        .await
        .map_err(|_| ReparentError::DeadlineExceeded { step: CATCHUP_STEP })?
        .map_err(|err| ReparentError::Step {
            step: CATCHUP_STEP,
            source: err,
        })?;
    tokio::time::timeout(timeout, agent.wait_for_position(waiter, &target))
        .await
        .map_err(|_| ReparentError::DeadlineExceeded { step: CATCHUP_STEP })?
        .map_err(|err| ReparentError::Step {
            step: CATCHUP_STEP,
            source: err,
        })
}
