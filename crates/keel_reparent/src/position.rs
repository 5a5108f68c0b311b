//! Replication position algebra.
//!
//! A position is the set of change records a server has applied, keyed by the
//! originating source id with inclusive transaction-id intervals per source.
//! Positions are partially ordered by containment: `a.at_least(&b)` holds when
//! every record in `b` is also in `a`. Two positions from the same replication
//! stream are always comparable; incomparable positions mean the streams
//! diverged.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One inclusive run of transaction ids from a single source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }
}

/// Set of applied change records, grouped by originating source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPosition {
    sets: BTreeMap<String, Vec<Interval>>,
}

impl ReplicationPosition {
    /// The empty (unknown) position.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.sets.is_empty()
    }

    /// Total number of change records across all sources. Used as a totally
    /// ordered sort proxy; containment remains the authoritative order.
    pub fn record_count(&self) -> u64 {
        self.sets
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(Interval::len)
            .sum()
    }

    /// True when every record in `other` is also present in `self`.
    pub fn at_least(&self, other: &Self) -> bool {
        other.sets.iter().all(|(source, intervals)| {
            let Some(own) = self.sets.get(source) else {
                return intervals.is_empty();
            };
            intervals.iter().all(|iv| contains_interval(own, *iv))
        })
    }

    /// True when one of the two positions contains the other.
    pub fn compatible(&self, other: &Self) -> bool {
        self.at_least(other) || other.at_least(self)
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut merged = self.sets.clone();
        for (source, intervals) in &other.sets {
            let entry = merged.entry(source.clone()).or_default();
            entry.extend(intervals.iter().copied());
        }
        for intervals in merged.values_mut() {
            normalize(intervals);
        }
        Self { sets: merged }
    }

    /// Records present in `self` but absent from `other`.
    pub fn subtract(&self, other: &Self) -> Self {
        let mut out = BTreeMap::new();
        for (source, intervals) in &self.sets {
            let remainder = match other.sets.get(source) {
                Some(theirs) => subtract_intervals(intervals, theirs),
                None => intervals.clone(),
            };
            if !remainder.is_empty() {
                out.insert(source.clone(), remainder);
            }
        }
        Self { sets: out }
    }

    /// Records in `self` that no sibling view has seen. Callers exempt the
    /// records of a legitimate source with [`Self::without_source`] first.
    /// An empty sibling set yields an empty result: with no basis for
    /// comparison, nothing can be called errant.
    pub fn errant_records(&self, siblings: &[&Self]) -> Self {
        if siblings.is_empty() {
            return Self::zero();
        }
        let mut seen = Self::zero();
        for sibling in siblings {
            seen = seen.union(sibling);
        }
        self.subtract(&seen)
    }

    /// The same position with every record originating from `source` removed.
    pub fn without_source(&self, source: &str) -> Self {
        let mut out = self.clone();
        out.sets.remove(source);
        out
    }

    /// Insert one interval for `source`, merging into the existing set.
    pub fn with_records(mut self, source: &str, start: u64, end: u64) -> Self {
        let entry = self.sets.entry(source.to_string()).or_default();
        entry.push(Interval { start, end });
        normalize(entry);
        self
    }
}

/// Merge overlapping/adjacent intervals in place, keeping the set sorted.
fn normalize(intervals: &mut Vec<Interval>) {
    intervals.sort_unstable();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

fn contains_interval(intervals: &[Interval], iv: Interval) -> bool {
    intervals
        .iter()
        .any(|own| own.start <= iv.start && iv.end <= own.end)
}

fn subtract_intervals(ours: &[Interval], theirs: &[Interval]) -> Vec<Interval> {
    let mut remainder = ours.to_vec();
    for cut in theirs {
        let mut next = Vec::with_capacity(remainder.len());
        for iv in remainder {
            if cut.end < iv.start || iv.end < cut.start {
                next.push(iv);
                continue;
            }
            if iv.start < cut.start {
                next.push(Interval {
                    start: iv.start,
                    end: cut.start - 1,
                });
            }
            if cut.end < iv.end {
                next.push(Interval {
                    start: cut.end + 1,
                    end: iv.end,
                });
            }
        }
        remainder = next;
    }
    remainder
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{source}")?;
            for iv in intervals {
                if iv.start == iv.end {
                    write!(f, ":{}", iv.start)?;
                } else {
                    write!(f, ":{}-{}", iv.start, iv.end)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for ReplicationPosition {
    type Err = anyhow::Error;

    /// Parse `source:1-5:8,other:3` into a position. An empty string is the
    /// zero position.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pos = Self::zero();
        if s.trim().is_empty() {
            return Ok(pos);
        }
        for part in s.split(',') {
            let mut pieces = part.trim().split(':');
            let source = pieces
                .next()
                .filter(|src| !src.is_empty())
                .ok_or_else(|| anyhow::anyhow!("position part {part:?} has no source id"))?;
            let mut any = false;
            for range in pieces {
                any = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (a.parse::<u64>()?, b.parse::<u64>()?),
                    None => {
                        let v = range.parse::<u64>()?;
                        (v, v)
                    }
                };
                if start == 0 || end < start {
                    anyhow::bail!("invalid interval {range:?} in position part {part:?}");
                }
                pos = pos.with_records(source, start, end);
            }
            if !any {
                anyhow::bail!("position part {part:?} has no intervals");
            }
        }
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(s: &str) -> ReplicationPosition {
        s.parse().expect("parse position")
    }

    #[test]
    fn parse_and_display_round_trip() {
        let p = pos("src1:1-10:15,src2:3");
        assert_eq!(p.to_string(), "src1:1-10:15,src2:3");
        assert_eq!(p.record_count(), 12);
        assert!(pos("").is_zero());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!("src1".parse::<ReplicationPosition>().is_err());
        assert!("src1:0-5".parse::<ReplicationPosition>().is_err());
        assert!("src1:9-3".parse::<ReplicationPosition>().is_err());
        assert!(":1-5".parse::<ReplicationPosition>().is_err());
    }

    #[test]
    fn at_least_is_containment() {
        let big = pos("s:1-20");
        let small = pos("s:5-10");
        assert!(big.at_least(&small));
        assert!(!small.at_least(&big));
        assert!(big.at_least(&big));
        assert!(big.at_least(&ReplicationPosition::zero()));
    }

    #[test]
    fn diverged_positions_are_incompatible() {
        let a = pos("s:1-10");
        let b = pos("t:1-10");
        assert!(!a.at_least(&b));
        assert!(!b.at_least(&a));
        assert!(!a.compatible(&b));
        assert!(a.compatible(&pos("s:1-5")));
    }

    #[test]
    fn union_merges_adjacent_runs() {
        let merged = pos("s:1-5").union(&pos("s:6-9,t:1"));
        assert_eq!(merged.to_string(), "s:1-9,t:1");
    }

    #[test]
    fn subtract_splits_intervals() {
        let left = pos("s:1-10").subtract(&pos("s:4-6"));
        assert_eq!(left.to_string(), "s:1-3:7-10");
        assert!(pos("s:1-5").subtract(&pos("s:1-9")).is_zero());
    }

    #[test]
    fn errant_records_against_sibling_views() {
        let me = pos("s:1-12,e:1");
        let sib1 = pos("s:1-12");
        let sib2 = pos("s:1-10");
        let errant = me.errant_records(&[&sib1, &sib2]);
        assert_eq!(errant.to_string(), "e:1");
        assert!(sib1.errant_records(&[&me]).is_zero());
        assert!(me.errant_records(&[]).is_zero());
    }

    #[test]
    fn own_source_records_are_exempted_before_the_errant_check() {
        // A replica that is simply ahead of its siblings carries extra
        // records from its own source; those are not errant.
        let ahead = pos("s:1-15");
        let sib = pos("s:1-10");
        assert!(ahead
            .without_source("s")
            .errant_records(&[&sib])
            .is_zero());
        assert_eq!(
            pos("s:1-15,e:1").without_source("s").to_string(),
            "e:1"
        );
    }
}
