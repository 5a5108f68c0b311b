//! Topology data model and the topology-store seam.
//!
//! The topology store is the strongly-consistent metadata service that owns
//! shard records, tablet records, and named exclusive shard locks. The
//! orchestrator only ever mutates the cluster while holding the shard lock,
//! and re-verifies the lock before every topology-altering phase.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Globally unique tablet address: failure-domain cell plus a numeric uid.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Role a tablet is currently serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletType {
    Primary,
    Replica,
    Rdonly,
    Spare,
    Backup,
    Restore,
    Drained,
}

impl TabletType {
    /// Backup-flavored and drained tablets never become primary.
    pub fn eligible_for_promotion(&self) -> bool {
        !matches!(self, Self::Backup | Self::Restore | Self::Drained)
    }
}

/// Per-tablet hint influencing who may become primary. Variant order is
/// promotion priority: earlier variants are preferred.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum PromotionRule {
    Must,
    Prefer,
    #[default]
    Neutral,
    PreferNot,
    MustNot,
}

/// One database process in a shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub hostname: String,
    pub tablet_type: TabletType,
    pub promotion_rule: PromotionRule,
}

/// Shard record as stored in the topology service. The primary alias may be
/// absent (never initialized) or stale (pointing at a dead tablet).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub keyspace: String,
    pub shard: String,
    pub primary_alias: Option<TabletAlias>,
}

/// Held shard lock. Must be released through `TopologyStore::unlock_shard`;
/// dropping it without unlocking leaves the lock to the store's lease expiry
/// and logs a warning.
#[derive(Debug)]
pub struct ShardLock {
    pub keyspace: String,
    pub shard: String,
    pub action: String,
    pub token: u64,
    released: bool,
}

impl ShardLock {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, action: impl Into<String>, token: u64) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            action: action.into(),
            token,
            released: false,
        }
    }

    /// Mark the lock as released so the drop guard stays quiet.
    pub fn mark_released(&mut self) {
        self.released = true;
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                keyspace = %self.keyspace,
                shard = %self.shard,
                action = %self.action,
                "shard lock dropped without explicit unlock"
            );
        }
    }
}

/// Strongly-consistent topology metadata service.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Acquire the named exclusive lock for a shard.
    async fn lock_shard(&self, keyspace: &str, shard: &str, action: &str)
        -> anyhow::Result<ShardLock>;

    /// Verify the shard lock is still held by this process.
    async fn check_shard_locked(&self, keyspace: &str, shard: &str) -> anyhow::Result<()>;

    /// Release a lock previously returned by `lock_shard`.
    async fn unlock_shard(&self, lock: ShardLock) -> anyhow::Result<()>;

    async fn get_shard(&self, keyspace: &str, shard: &str) -> anyhow::Result<ShardInfo>;

    async fn get_tablet(&self, alias: &TabletAlias) -> anyhow::Result<Tablet>;

    /// All tablet records for a shard, keyed by alias string.
    async fn get_tablet_map_for_shard(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> anyhow::Result<BTreeMap<String, Tablet>>;
}

#[derive(Default)]
struct TopoInner {
    shards: BTreeMap<(String, String), ShardInfo>,
    tablets: BTreeMap<String, Tablet>,
    locks: BTreeMap<(String, String), (u64, String)>,
}

/// In-memory topology store with named exclusive shard locks. Backs the
/// integration suites and embedding tests; real deployments implement
/// `TopologyStore` against their metadata service.
#[derive(Default)]
pub struct MemoryTopology {
    inner: Mutex<TopoInner>,
    next_token: AtomicU64,
    unlocks: AtomicU64,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infallible accessors recover the guard on poison: a panicked holder
    /// leaves the maps themselves intact.
    fn state(&self) -> MutexGuard<'_, TopoInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_checked(&self) -> anyhow::Result<MutexGuard<'_, TopoInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("topology state lock poisoned"))
    }

    pub fn upsert_shard(&self, info: ShardInfo) {
        let mut inner = self.state();
        inner
            .shards
            .insert((info.keyspace.clone(), info.shard.clone()), info);
    }

    pub fn upsert_tablet(&self, tablet: Tablet) {
        let mut inner = self.state();
        inner.tablets.insert(tablet.alias.to_string(), tablet);
    }

    pub fn set_shard_primary(&self, keyspace: &str, shard: &str, primary: Option<TabletAlias>) {
        let mut inner = self.state();
        if let Some(info) = inner
            .shards
            .get_mut(&(keyspace.to_string(), shard.to_string()))
        {
            info.primary_alias = primary;
        }
    }

    /// Force-release a shard lock, simulating lock loss (lease expiry, topo
    /// partition). Returns whether a lock was held.
    pub fn break_lock(&self, keyspace: &str, shard: &str) -> bool {
        let mut inner = self.state();
        inner
            .locks
            .remove(&(keyspace.to_string(), shard.to_string()))
            .is_some()
    }

    pub fn active_locks(&self) -> usize {
        self.state().locks.len()
    }

    /// Number of successful explicit unlocks since construction.
    pub fn unlock_count(&self) -> u64 {
        self.unlocks.load(Ordering::Relaxed)
    }

    /// JSON snapshot of shard and tablet records, for debugging and tests.
    pub fn state_json(&self) -> anyhow::Result<String> {
        let inner = self.state_checked()?;
        let shards: BTreeMap<String, &ShardInfo> = inner
            .shards
            .iter()
            .map(|((ks, shard), info)| (format!("{ks}/{shard}"), info))
            .collect();
        let state = serde_json::json!({
            "shards": shards,
            "tablets": inner.tablets,
        });
        serde_json::to_string_pretty(&state).context("serialize topology state")
    }
}

#[async_trait]
impl TopologyStore for MemoryTopology {
    async fn lock_shard(
        &self,
        keyspace: &str,
        shard: &str,
        action: &str,
    ) -> anyhow::Result<ShardLock> {
        let mut inner = self.state_checked()?;
        let key = (keyspace.to_string(), shard.to_string());
        if let Some((_, held_for)) = inner.locks.get(&key) {
            anyhow::bail!("shard {keyspace}/{shard} is already locked for {held_for}");
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        inner.locks.insert(key, (token, action.to_string()));
        Ok(ShardLock::new(keyspace, shard, action, token))
    }

    async fn check_shard_locked(&self, keyspace: &str, shard: &str) -> anyhow::Result<()> {
        let inner = self.state_checked()?;
        if inner
            .locks
            .contains_key(&(keyspace.to_string(), shard.to_string()))
        {
            Ok(())
        } else {
            anyhow::bail!("shard {keyspace}/{shard} is not locked")
        }
    }

    async fn unlock_shard(&self, mut lock: ShardLock) -> anyhow::Result<()> {
        let mut inner = self.state_checked()?;
        let key = (lock.keyspace.clone(), lock.shard.clone());
        let held = inner.locks.get(&key).map(|(token, _)| *token);
        lock.mark_released();
        match held {
            Some(token) if token == lock.token => {
                inner.locks.remove(&key);
                self.unlocks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(_) => anyhow::bail!(
                "shard {}/{} is locked by another holder",
                lock.keyspace,
                lock.shard
            ),
            None => anyhow::bail!("shard {}/{} is not locked", lock.keyspace, lock.shard),
        }
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> anyhow::Result<ShardInfo> {
        let inner = self.state_checked()?;
        inner
            .shards
            .get(&(keyspace.to_string(), shard.to_string()))
            .cloned()
            .with_context(|| format!("shard {keyspace}/{shard} not found"))
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> anyhow::Result<Tablet> {
        let inner = self.state_checked()?;
        inner
            .tablets
            .get(&alias.to_string())
            .cloned()
            .with_context(|| format!("tablet {alias} not found"))
    }

    async fn get_tablet_map_for_shard(
        &self,
        _keyspace: &str,
        _shard: &str,
    ) -> anyhow::Result<BTreeMap<String, Tablet>> {
        let inner = self.state_checked()?;
        Ok(inner.tablets.clone())
    }
}
