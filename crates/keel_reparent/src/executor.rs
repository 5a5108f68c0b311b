//! Reparent fan-out execution.
//!
//! Points every replica at a chosen primary while, concurrently, the primary
//! side reads its position and (when promoting for real) writes the reparent
//! journal row. The step exposes two completion signals: "first replica
//! accepted" for the fast path and "all replicas done" for the phase that
//! needs the full accepted set.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{StopStatusMap, TabletAgentClient};
use crate::errors::ReparentError;
use crate::events::{EventDispatcher, Reparent};
use crate::reparenter::EmergencyReparentOptions;
use crate::topology::Tablet;

const STEP: &str = "reparent replicas";
const PRIMARY_STEP: &str = "populate reparent journal on primary";

fn epoch_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(i64::MAX as u128) as i64
}

/// Reparent every non-ignored replica to `new_primary`.
///
/// `wait_for_all=false` returns as soon as the primary-side step succeeds and
/// at least one replica accepts; the remaining tasks keep running under the
/// step timeout and their results are ignored, so the accepted list comes
/// back empty. `wait_for_all=true` joins every task and returns the
/// accumulated accepted list (the step fails only when every replica failed).
#[allow(clippy::too_many_arguments)]
pub async fn reparent_replicas(
    agent: &Arc<dyn TabletAgentClient>,
    dispatcher: &EventDispatcher,
    ev: &mut Reparent,
    new_primary: &Tablet,
    tablet_map: &BTreeMap<String, Tablet>,
    stop_status: &StopStatusMap,
    opts: &EmergencyReparentOptions,
    lock_action: &str,
    wait_for_all: bool,
    populate_journal: bool,
) -> Result<Vec<Tablet>, ReparentError> {
    dispatcher.update(ev, "reparenting all tablets");

    let accepted = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::<anyhow::Error>::new()));
    let repl_cancel = CancellationToken::new();
    let first_success = CancellationToken::new();
    let all_done = CancellationToken::new();
    let timeout = opts.wait_replicas_timeout;

    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut num_replicas = 0usize;
    for tablet in tablet_map.values() {
        if tablet.alias == new_primary.alias || opts.ignore_replicas.contains(&tablet.alias) {
            continue;
        }
        num_replicas += 1;

        let force_start = stop_status
            .get(&tablet.alias.to_string())
            .map(|status| status.was_running())
            .unwrap_or(false);
        let agent = Arc::clone(agent);
        let tablet = tablet.clone();
        let source = new_primary.alias.clone();
        let accepted = Arc::clone(&accepted);
        let errors = Arc::clone(&errors);
        let repl_cancel = repl_cancel.clone();
        let first_success = first_success.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            // Holding the sender until task exit is what closes the done
            // channel once every replica task has finished.
            let _done = done_tx;
            let alias = tablet.alias.to_string();
            tracing::info!(
                tablet = %alias,
                source = %source,
                "setting replication source on replica"
            );
            let res = tokio::select! {
                _ = repl_cancel.cancelled() => {
                    Err(anyhow::anyhow!("set source cancelled for {alias}"))
                }
                res = tokio::time::timeout(
                    timeout,
                    agent.set_source(&tablet, &source, force_start),
                ) => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(err.context(format!("set source failed on {alias}"))),
                    Err(_) => Err(anyhow::anyhow!("set source timed out on {alias}")),
                },
            };
            match res {
                Ok(()) => {
                    // Recover the guard on poison: a panicked sibling task
                    // leaves the list itself intact.
                    accepted
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(tablet);
                    if !wait_for_all {
                        first_success.cancel();
                    }
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "replica failed to accept the new source");
                    errors.lock().unwrap_or_else(|e| e.into_inner()).push(err);
                }
            }
        });
    }
    drop(done_tx);

    {
        let all_done = all_done.clone();
        tokio::spawn(async move {
            while done_rx.recv().await.is_some() {}
            all_done.cancel();
        });
    }

    // Primary side runs on the caller's task, concurrently with the replica
    // fan-out. Its failure is fatal for the whole step.
    let primary_alias = new_primary.alias.to_string();
    let primary_res: anyhow::Result<()> = async {
        let position = tokio::time::timeout(timeout, agent.primary_position(new_primary))
            .await
            .map_err(|_| anyhow::anyhow!("primary position read timed out on {primary_alias}"))??;
        if populate_journal {
            tracing::info!(tablet = %primary_alias, "populating reparent journal on new primary");
            tokio::time::timeout(
                timeout,
                agent.populate_reparent_journal(
                    new_primary,
                    epoch_nanos(),
                    lock_action,
                    &new_primary.alias,
                    &position,
                ),
            )
            .await
            .map_err(|_| anyhow::anyhow!("reparent journal write timed out on {primary_alias}"))??;
        }
        Ok(())
    }
    .await;
    if let Err(err) = primary_res {
        repl_cancel.cancel();
        return Err(ReparentError::Step {
            step: PRIMARY_STEP,
            source: err,
        });
    }

    if num_replicas == 0 {
        return Ok(Vec::new());
    }

    let all_failed_error = |errors: &[anyhow::Error]| ReparentError::Step {
        step: STEP,
        source: anyhow::anyhow!(
            "{} replica(s) failed: {}",
            num_replicas,
            errors
                .iter()
                .map(|err| format!("{err:#}"))
                .collect::<Vec<_>>()
                .join("; ")
        ),
    };

    if wait_for_all {
        all_done.cancelled().await;
        let errors = errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() == num_replicas {
            return Err(all_failed_error(&errors));
        }
        return Ok(accepted.lock().unwrap_or_else(|e| e.into_inner()).clone());
    }

    tokio::select! {
        _ = first_success.cancelled() => Ok(Vec::new()),
        _ = all_done.cancelled() => {
            let errors = errors.lock().unwrap_or_else(|e| e.into_inner());
            if errors.len() == num_replicas {
                return Err(all_failed_error(&errors));
            }
            Ok(accepted.lock().unwrap_or_else(|e| e.into_inner()).clone())
        }
    }
}

/// Funnel every replica into the intermediate source without promoting it.
/// Waits for all replicas so the full accepted set is available when looking
/// for a better final candidate; the intermediate itself is part of that set.
#[allow(clippy::too_many_arguments)]
pub async fn promote_intermediate(
    agent: &Arc<dyn TabletAgentClient>,
    dispatcher: &EventDispatcher,
    ev: &mut Reparent,
    intermediate: &Tablet,
    tablet_map: &BTreeMap<String, Tablet>,
    stop_status: &StopStatusMap,
    opts: &EmergencyReparentOptions,
    lock_action: &str,
) -> Result<Vec<Tablet>, ReparentError> {
    let mut accepted = reparent_replicas(
        agent,
        dispatcher,
        ev,
        intermediate,
        tablet_map,
        stop_status,
        opts,
        lock_action,
        true,
        false,
    )
    .await?;
    accepted.push(intermediate.clone());
    Ok(accepted)
}
