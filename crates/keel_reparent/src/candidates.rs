//! Candidate filtering and selection policy.
//!
//! Filtering turns the raw stop-replication results into a map of promotable
//! candidates: tablets with a known position and no errant change records,
//! restricted to eligible types. Selection first picks the most advanced
//! survivor as the intermediate source, then looks for a preferable final
//! primary among the tablets that accepted the intermediate.

use std::collections::{BTreeMap, BTreeSet};
use std::cmp::Ordering;

use crate::agent::{PrimaryStatusMap, StopStatusMap};
use crate::errors::ReparentError;
use crate::position::ReplicationPosition;
use crate::reparenter::EmergencyReparentOptions;
use crate::topology::{PromotionRule, Tablet, TabletAlias};

/// Promotable candidates, keyed by alias string.
pub type ValidCandidateMap = BTreeMap<String, ReplicationPosition>;

/// Build the candidate map from both status maps.
///
/// Replicas contribute their relay-log position (everything already fetched,
/// which they will reach after catch-up), falling back to the executed
/// position when the relay-log position is unknown. A replica is excluded as
/// errant when it carries records that neither originate from its own
/// replication source nor appear on any other candidate. Self-styled
/// primaries contribute their primary position unfiltered: a stuck primary
/// with a winning position is promotable, trusting the operator.
pub fn find_valid_candidates(
    stop_status: &StopStatusMap,
    primary_status: &PrimaryStatusMap,
) -> ValidCandidateMap {
    let mut raw: BTreeMap<String, ReplicationPosition> = BTreeMap::new();
    for (alias, status) in stop_status {
        let pos = if status.after.relay_log_position.is_zero() {
            status.after.position.clone()
        } else {
            status.after.relay_log_position.clone()
        };
        raw.insert(alias.clone(), pos);
    }
    for (alias, status) in primary_status {
        raw.insert(alias.clone(), status.position.clone());
    }

    let mut out = ValidCandidateMap::new();
    for (alias, pos) in &raw {
        if pos.is_zero() {
            tracing::warn!(tablet = %alias, "candidate has no known position, skipping");
            continue;
        }
        if let Some(status) = stop_status.get(alias) {
            let siblings: Vec<&ReplicationPosition> = raw
                .iter()
                .filter(|(other, _)| *other != alias)
                .map(|(_, p)| p)
                .collect();
            let errant = pos
                .without_source(&status.after.source_id)
                .errant_records(&siblings);
            if !errant.is_zero() {
                tracing::warn!(
                    tablet = %alias,
                    errant = %errant,
                    "candidate has errant change records, skipping"
                );
                continue;
            }
        }
        out.insert(alias.clone(), pos.clone());
    }
    out
}

/// Drop ignored aliases and ineligible tablet types. Failing to find any
/// candidate at all fails the operation.
pub fn restrict_valid_candidates(
    candidates: ValidCandidateMap,
    tablet_map: &BTreeMap<String, Tablet>,
    ignore: &BTreeSet<TabletAlias>,
) -> Result<ValidCandidateMap, ReparentError> {
    let mut out = ValidCandidateMap::new();
    for (alias, pos) in candidates {
        let Some(tablet) = tablet_map.get(&alias) else {
            return Err(ReparentError::Inconsistent { alias });
        };
        if ignore.contains(&tablet.alias) {
            tracing::info!(tablet = %alias, "candidate is in the ignore set, skipping");
            continue;
        }
        if !tablet.tablet_type.eligible_for_promotion() {
            tracing::info!(
                tablet = %alias,
                tablet_type = ?tablet.tablet_type,
                "candidate type is not eligible for promotion, skipping"
            );
            continue;
        }
        out.insert(alias, pos);
    }
    if out.is_empty() {
        return Err(ReparentError::NoValidCandidates);
    }
    Ok(out)
}

fn cell_rank(tablet: &Tablet, ideal_cell: Option<&str>) -> u8 {
    match ideal_cell {
        Some(cell) if tablet.alias.cell == cell => 0,
        _ => 1,
    }
}

fn candidate_order(
    a: &(Tablet, ReplicationPosition),
    b: &(Tablet, ReplicationPosition),
    ideal_cell: Option<&str>,
) -> Ordering {
    b.1.record_count()
        .cmp(&a.1.record_count())
        .then_with(|| cell_rank(&a.0, ideal_cell).cmp(&cell_rank(&b.0, ideal_cell)))
        .then_with(|| a.0.promotion_rule.cmp(&b.0.promotion_rule))
        .then_with(|| a.0.alias.cmp(&b.0.alias))
}

/// Deterministic candidate order: most records first, previous primary's cell
/// preferred, then promotion priority, then alias. Record count is a total
/// proxy for the containment order; the split-brain check right after the
/// sort guarantees the head actually dominates.
pub(crate) fn sort_candidates(
    entries: &mut [(Tablet, ReplicationPosition)],
    ideal_cell: Option<&str>,
) {
    entries.sort_by(|a, b| candidate_order(a, b, ideal_cell));
}

/// Pick the intermediate source: the most advanced candidate, which must
/// dominate every other candidate's position or the shard has split-brained.
/// A requested primary that is already as advanced takes over directly;
/// a requested primary that is behind stays a later catch-up target.
///
/// Returns the winner and the full sorted candidate list.
pub fn find_most_advanced(
    prev_primary: Option<&Tablet>,
    valid: &ValidCandidateMap,
    tablet_map: &BTreeMap<String, Tablet>,
    opts: &EmergencyReparentOptions,
) -> Result<(Tablet, Vec<Tablet>), ReparentError> {
    if valid.is_empty() {
        return Err(ReparentError::NoValidCandidates);
    }
    let mut entries: Vec<(Tablet, ReplicationPosition)> = Vec::with_capacity(valid.len());
    for (alias, pos) in valid {
        let Some(tablet) = tablet_map.get(alias) else {
            return Err(ReparentError::Inconsistent {
                alias: alias.clone(),
            });
        };
        entries.push((tablet.clone(), pos.clone()));
    }

    let ideal_cell = prev_primary.map(|t| t.alias.cell.as_str());
    sort_candidates(&mut entries, ideal_cell);
    for (tablet, pos) in &entries {
        tracing::debug!(tablet = %tablet.alias, position = %pos, "sorted candidate");
    }

    let (mut winner, winner_pos) = entries[0].clone();
    for (tablet, pos) in &entries[1..] {
        if !winner_pos.at_least(pos) {
            return Err(ReparentError::SplitBrain {
                first: winner.alias,
                second: tablet.alias.clone(),
            });
        }
    }

    if let Some(requested) = &opts.new_primary_alias {
        let key = requested.to_string();
        let Some(requested_pos) = valid.get(&key) else {
            return Err(ReparentError::ErrantRequested {
                alias: requested.clone(),
            });
        };
        if requested_pos.at_least(&winner_pos) {
            winner = tablet_map
                .get(&key)
                .ok_or(ReparentError::Inconsistent { alias: key })?
                .clone();
        }
    }

    Ok((winner, entries.into_iter().map(|(t, _)| t).collect()))
}

/// Within one preference rung: the intermediate itself wins if it qualifies,
/// otherwise the first qualifying tablet in candidate order.
fn candidate_from_list<'a>(
    list: &[&'a Tablet],
    intermediate: &Tablet,
    prev_cell: Option<&str>,
    same_cell: bool,
) -> Option<&'a Tablet> {
    let fits = |tablet: &Tablet| {
        !same_cell || prev_cell.is_some_and(|cell| tablet.alias.cell == cell)
    };
    if let Some(own) = list.iter().copied().find(|t| t.alias == intermediate.alias) {
        if fits(own) {
            return Some(own);
        }
    }
    list.iter().copied().find(|t| fits(t))
}

/// Decide the final primary among the tablets that accepted the intermediate
/// (the intermediate included). A requested primary wins unconditionally when
/// present; otherwise walk the preference ladder, honoring the cross-cell
/// restriction, and fall back to the intermediate unchanged.
pub fn identify_primary_candidate(
    intermediate: &Tablet,
    prev_primary: Option<&Tablet>,
    valid: &[Tablet],
    tablet_map: &BTreeMap<String, Tablet>,
    opts: &EmergencyReparentOptions,
) -> Result<Tablet, ReparentError> {
    if let Some(requested) = &opts.new_primary_alias {
        let key = requested.to_string();
        let Some(tablet) = tablet_map.get(&key) else {
            return Err(ReparentError::Inconsistent { alias: key });
        };
        if valid.iter().any(|t| t.alias == *requested) {
            return Ok(tablet.clone());
        }
        return Err(ReparentError::RequestedNotValid {
            alias: requested.clone(),
        });
    }

    let preferred: Vec<&Tablet> = valid
        .iter()
        .filter(|t| matches!(t.promotion_rule, PromotionRule::Must | PromotionRule::Prefer))
        .collect();
    let neutral: Vec<&Tablet> = valid
        .iter()
        .filter(|t| t.promotion_rule == PromotionRule::Neutral)
        .collect();
    let prev_cell = prev_primary.map(|t| t.alias.cell.as_str());

    let rungs: [(&[&Tablet], bool); 4] = [
        (preferred.as_slice(), true),
        (preferred.as_slice(), false),
        (neutral.as_slice(), true),
        (neutral.as_slice(), false),
    ];
    for (list, same_cell) in rungs {
        if !same_cell && opts.prevent_cross_cell_promotion {
            continue;
        }
        if let Some(candidate) = candidate_from_list(list, intermediate, prev_cell, same_cell) {
            if candidate.alias != intermediate.alias {
                tracing::info!(tablet = %candidate.alias, "found better primary candidate");
            }
            return Ok(candidate.clone());
        }
    }

    Ok(intermediate.clone())
}

/// Whether the intermediate source is already the final choice.
pub fn intermediate_is_ideal(
    intermediate: &Tablet,
    prev_primary: Option<&Tablet>,
    valid: &[Tablet],
    tablet_map: &BTreeMap<String, Tablet>,
    opts: &EmergencyReparentOptions,
) -> Result<bool, ReparentError> {
    let candidate = identify_primary_candidate(intermediate, prev_primary, valid, tablet_map, opts)?;
    Ok(candidate.alias == intermediate.alias)
}
