//! Equivalence registry: groups, memberships, representatives and candidates.
//!
//! Invariants held here:
//! - a store is a member of at most one group (primary key on `store_group_members`)
//! - a group's representative is a member of that group
//! - a store pending as candidate is pending in exactly one group and is never a
//!   representative anywhere
//!
//! Every mutation runs in one IMMEDIATE transaction through [`DbBroker::with_tx`], so
//! a failed rebuild leaves the previous grouping untouched.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::ShelfwiseError;
use crate::core::output::{self, OutputFormat};
use crate::core::store::{STORE_COLUMNS, Store};
use crate::core::time;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Latest price per product for one store.
pub type PriceSet = BTreeMap<String, f64>;

const ACTOR: &str = "registry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Active,
    DivergenceDetected,
    Retired,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::DivergenceDetected => "divergence_detected",
            GroupStatus::Retired => "retired",
        }
    }
}

impl FromStr for GroupStatus {
    type Err = ShelfwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(GroupStatus::Active),
            "divergence_detected" => Ok(GroupStatus::DivergenceDetected),
            "retired" => Ok(GroupStatus::Retired),
            other => Err(ShelfwiseError::ValidationError(format!(
                "unknown group status '{}'",
                other
            ))),
        }
    }
}

/// Which pass produced a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GroupMethod {
    Geo,
    Correlation,
    Manual,
}

impl GroupMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupMethod::Geo => "geo",
            GroupMethod::Correlation => "correlation",
            GroupMethod::Manual => "manual",
        }
    }
}

impl fmt::Display for GroupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupMethod {
    type Err = ShelfwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geo" => Ok(GroupMethod::Geo),
            "correlation" => Ok(GroupMethod::Correlation),
            "manual" => Ok(GroupMethod::Manual),
            other => Err(ShelfwiseError::ValidationError(format!(
                "unknown group method '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub store_id: i64,
    pub attempts: u32,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreGroup {
    pub id: String,
    pub chain: String,
    pub method: GroupMethod,
    pub status: GroupStatus,
    pub active: bool,
    pub representative: Option<i64>,
    /// Member store ids, ascending.
    pub members: Vec<i64>,
    pub candidates: Vec<Candidate>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoreGroup {
    pub fn has_member(&self, store_id: i64) -> bool {
        self.members.binary_search(&store_id).is_ok()
    }

    pub fn candidate(&self, store_id: i64) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.store_id == store_id)
    }
}

/// Attribute record from the store feed. Scheduler-owned columns are not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: i64,
    pub chain: String,
    #[serde(default)]
    pub division: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub store_id: i64,
    pub product_id: String,
    pub price: f64,
    pub observed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMember {
    pub store_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub chain: String,
    pub groups_removed: usize,
    pub groups_created: usize,
    pub members_linked: usize,
    pub skipped: Vec<SkippedMember>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub skipped: usize,
}

/// Handle to the registry database under a data root.
pub struct Registry {
    root: PathBuf,
    db_path: PathBuf,
    broker: DbBroker,
}

impl Registry {
    /// Open (and create if needed) the registry under `root`.
    pub fn open(root: &Path) -> Result<Registry, ShelfwiseError> {
        db::initialize_registry_db(root)?;
        Ok(Registry {
            root: root.to_path_buf(),
            db_path: db::registry_db_path(root),
            broker: DbBroker::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn broker(&self) -> &DbBroker {
        &self.broker
    }

    // ----- stores -----

    /// Insert or update store attributes. A chain change releases the store from
    /// its old chain's group.
    pub fn upsert_stores(&self, records: &[StoreRecord]) -> Result<IngestSummary, ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.upsert_stores", |tx| {
                let mut summary = IngestSummary::default();
                for rec in records {
                    if rec.chain.trim().is_empty() {
                        tracing::warn!(store_id = rec.id, "store record without chain skipped");
                        summary.skipped += 1;
                        continue;
                    }
                    let previous: Option<String> = tx
                        .query_row(
                            "SELECT chain FROM stores WHERE id = ?1",
                            params![rec.id],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if previous.as_deref().is_some_and(|c| c != rec.chain) {
                        tracing::warn!(
                            store_id = rec.id,
                            from = previous.as_deref().unwrap_or_default(),
                            to = %rec.chain,
                            "store changed chain; releasing group membership"
                        );
                        release_store(tx, rec.id)?;
                    }
                    tx.execute(
                        "INSERT INTO stores(id, chain, division, latitude, longitude, active)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(id) DO UPDATE SET
                           chain = excluded.chain,
                           division = excluded.division,
                           latitude = excluded.latitude,
                           longitude = excluded.longitude,
                           active = excluded.active",
                        params![
                            rec.id,
                            rec.chain,
                            rec.division,
                            rec.latitude,
                            rec.longitude,
                            rec.active as i64
                        ],
                    )?;
                    summary.accepted += 1;
                }
                Ok(summary)
            })
    }

    pub fn get_store(&self, store_id: i64) -> Result<Option<Store>, ShelfwiseError> {
        self.broker.with_read(&self.db_path, |conn| load_store(conn, store_id))
    }

    /// All stores of a chain, ascending id.
    pub fn list_stores(&self, chain: &str) -> Result<Vec<Store>, ShelfwiseError> {
        self.broker.with_read(&self.db_path, |conn| {
            let sql = format!(
                "SELECT {} FROM stores WHERE chain = ?1 ORDER BY id",
                STORE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![chain], Store::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Manually flag (or clear) a store for rescraping.
    pub fn set_needs_rescraping(&self, store_id: i64, flag: bool) -> Result<(), ShelfwiseError> {
        self.broker
            .with_conn(&self.db_path, ACTOR, "registry.flag_rescrape", |conn| {
                let n = conn.execute(
                    "UPDATE stores SET needs_rescraping = ?1 WHERE id = ?2",
                    params![flag as i64, store_id],
                )?;
                if n == 0 {
                    return Err(ShelfwiseError::NotFound(format!("store {}", store_id)));
                }
                Ok(())
            })
    }

    // ----- prices -----

    /// Record price observations. Older observations never replace newer ones;
    /// observations for unknown stores are skipped with a warning.
    pub fn record_prices(
        &self,
        observations: &[PriceObservation],
    ) -> Result<IngestSummary, ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.record_prices", |tx| {
                let known: FxHashSet<i64> = {
                    let mut stmt = tx.prepare("SELECT id FROM stores")?;
                    stmt.query_map([], |r| r.get::<_, i64>(0))?
                        .collect::<Result<_, _>>()?
                };
                let mut summary = IngestSummary::default();
                let mut stmt = tx.prepare(
                    "INSERT INTO prices(store_id, product_id, price, observed_at)
                     VALUES(?1, ?2, ?3, ?4)
                     ON CONFLICT(store_id, product_id) DO UPDATE SET
                       price = excluded.price,
                       observed_at = excluded.observed_at
                     WHERE excluded.observed_at >= prices.observed_at",
                )?;
                for obs in observations {
                    if !known.contains(&obs.store_id) || !obs.price.is_finite() {
                        tracing::warn!(
                            store_id = obs.store_id,
                            product = %obs.product_id,
                            "price observation skipped"
                        );
                        summary.skipped += 1;
                        continue;
                    }
                    stmt.execute(params![
                        obs.store_id,
                        obs.product_id,
                        obs.price,
                        obs.observed_at
                    ])?;
                    summary.accepted += 1;
                }
                Ok(summary)
            })
    }

    pub fn latest_prices(&self, store_id: i64) -> Result<PriceSet, ShelfwiseError> {
        self.broker
            .with_read(&self.db_path, |conn| load_prices(conn, store_id))
    }

    /// Latest prices for every active store of `chain` with at least
    /// `min_products` distinct priced products.
    pub fn chain_prices(
        &self,
        chain: &str,
        min_products: usize,
    ) -> Result<BTreeMap<i64, PriceSet>, ShelfwiseError> {
        self.broker.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.store_id, p.product_id, p.price
                 FROM prices p JOIN stores s ON s.id = p.store_id
                 WHERE s.chain = ?1 AND s.active = 1
                 ORDER BY p.store_id",
            )?;
            let mut out: BTreeMap<i64, PriceSet> = BTreeMap::new();
            let rows = stmt.query_map(params![chain], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })?;
            for row in rows {
                let (store_id, product, price) = row?;
                out.entry(store_id).or_default().insert(product, price);
            }
            out.retain(|_, prices| prices.len() >= min_products);
            Ok(out)
        })
    }

    // ----- groups -----

    /// Atomically create a group with the given members.
    pub fn create_group(
        &self,
        chain: &str,
        method: GroupMethod,
        members: &[i64],
    ) -> Result<String, ShelfwiseError> {
        if members.is_empty() {
            return Err(ShelfwiseError::ValidationError(
                "a group needs at least one member".to_string(),
            ));
        }
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.create_group", |tx| {
                let mut seen = FxHashSet::default();
                for &store_id in members {
                    if !seen.insert(store_id) {
                        return Err(ShelfwiseError::Conflict(format!(
                            "store {} listed twice",
                            store_id
                        )));
                    }
                    let store = load_store(tx, store_id)?
                        .ok_or_else(|| ShelfwiseError::NotFound(format!("store {}", store_id)))?;
                    if store.chain != chain {
                        return Err(ShelfwiseError::ValidationError(format!(
                            "store {} belongs to chain '{}', not '{}'",
                            store_id, store.chain, chain
                        )));
                    }
                    if let Some(existing) = membership_of(tx, store_id)? {
                        return Err(ShelfwiseError::Conflict(format!(
                            "store {} is already a member of group {}",
                            store_id, existing
                        )));
                    }
                }
                let id = ulid::Ulid::new().to_string();
                insert_group(tx, &id, chain, method, members, time::now_epoch())?;
                Ok(id)
            })
    }

    pub fn set_representative(&self, group_id: &str, store_id: i64) -> Result<(), ShelfwiseError> {
        self.set_representative_at(group_id, store_id, time::now_epoch())
    }

    pub fn set_representative_at(
        &self,
        group_id: &str,
        store_id: i64,
        now: i64,
    ) -> Result<(), ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.set_representative", |tx| {
                set_representative_tx(tx, group_id, store_id, now)
            })
    }

    /// Mark a group as diverged. Idempotent.
    pub fn flag_divergence(&self, group_id: &str) -> Result<(), ShelfwiseError> {
        self.flag_divergence_at(group_id, time::now_epoch())
    }

    pub fn flag_divergence_at(&self, group_id: &str, now: i64) -> Result<(), ShelfwiseError> {
        self.set_status(
            group_id,
            GroupStatus::DivergenceDetected,
            "registry.flag_divergence",
            now,
        )
    }

    /// Return a diverged group to ACTIVE. Idempotent.
    pub fn mark_active(&self, group_id: &str) -> Result<(), ShelfwiseError> {
        self.mark_active_at(group_id, time::now_epoch())
    }

    pub fn mark_active_at(&self, group_id: &str, now: i64) -> Result<(), ShelfwiseError> {
        self.set_status(group_id, GroupStatus::Active, "registry.mark_active", now)
    }

    fn set_status(
        &self,
        group_id: &str,
        status: GroupStatus,
        op: &str,
        now: i64,
    ) -> Result<(), ShelfwiseError> {
        self.broker.with_tx(&self.db_path, ACTOR, op, |tx| {
            let current = group_status(tx, group_id)?;
            if current == GroupStatus::Retired {
                return Err(ShelfwiseError::ValidationError(format!(
                    "group {} is retired",
                    group_id
                )));
            }
            if current != status {
                tx.execute(
                    "UPDATE store_groups SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, group_id],
                )?;
                tracing::info!(group_id, status = status.as_str(), "group status changed");
            }
            Ok(())
        })
    }

    /// Retire a group: inactive, no members, no candidates, no representative.
    pub fn retire_group(&self, group_id: &str) -> Result<(), ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.retire_group", |tx| {
                group_status(tx, group_id)?;
                tx.execute(
                    "DELETE FROM group_candidates WHERE group_id = ?1",
                    params![group_id],
                )?;
                tx.execute(
                    "DELETE FROM store_group_members WHERE group_id = ?1",
                    params![group_id],
                )?;
                tx.execute(
                    "UPDATE store_groups
                     SET status = 'retired', active = 0, representative_id = NULL, updated_at = ?1
                     WHERE id = ?2",
                    params![time::now_epoch(), group_id],
                )?;
                Ok(())
            })
    }

    /// Queue a member for validation against the representative.
    pub fn add_candidate(&self, group_id: &str, store_id: i64) -> Result<(), ShelfwiseError> {
        self.add_candidate_at(group_id, store_id, time::now_epoch())
    }

    pub fn add_candidate_at(
        &self,
        group_id: &str,
        store_id: i64,
        now: i64,
    ) -> Result<(), ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.add_candidate", |tx| {
                group_status(tx, group_id)?;
                if is_pending(tx, store_id)? {
                    return Err(ShelfwiseError::AlreadyPending { store_id });
                }
                if membership_of(tx, store_id)?.as_deref() != Some(group_id) {
                    return Err(ShelfwiseError::NotAMember {
                        group_id: group_id.to_string(),
                        store_id,
                    });
                }
                tx.execute(
                    "INSERT INTO group_candidates(store_id, group_id, attempts, enqueued_at)
                     VALUES(?1, ?2, 0, ?3)",
                    params![store_id, group_id, now],
                )?;
                Ok(())
            })
    }

    /// Returns whether a candidate row was removed.
    pub fn remove_candidate(&self, group_id: &str, store_id: i64) -> Result<bool, ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.remove_candidate", |tx| {
                let n = tx.execute(
                    "DELETE FROM group_candidates WHERE group_id = ?1 AND store_id = ?2",
                    params![group_id, store_id],
                )?;
                Ok(n > 0)
            })
    }

    /// Count one failed validation for a candidate; returns the new attempt count.
    pub fn record_candidate_miss(
        &self,
        group_id: &str,
        store_id: i64,
    ) -> Result<u32, ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.candidate_miss", |tx| {
                let n = tx.execute(
                    "UPDATE group_candidates SET attempts = attempts + 1
                     WHERE group_id = ?1 AND store_id = ?2",
                    params![group_id, store_id],
                )?;
                if n == 0 {
                    return Err(ShelfwiseError::NotFound(format!(
                        "candidate {} in group {}",
                        store_id, group_id
                    )));
                }
                let attempts: u32 = tx.query_row(
                    "SELECT attempts FROM group_candidates WHERE store_id = ?1",
                    params![store_id],
                    |r| r.get(0),
                )?;
                Ok(attempts)
            })
    }

    /// Destructively replace every group of `chain` with `groups`.
    ///
    /// Members that are unknown, belong to another chain, or already appear in an
    /// earlier proposed group are skipped with a warning. Either the whole rebuild
    /// commits or the previous grouping stays.
    pub fn rebuild_chain(
        &self,
        chain: &str,
        method: GroupMethod,
        groups: &[Vec<i64>],
    ) -> Result<RebuildSummary, ShelfwiseError> {
        self.broker
            .with_tx(&self.db_path, ACTOR, "registry.rebuild_chain", |tx| {
                let mut summary = RebuildSummary {
                    chain: chain.to_string(),
                    ..RebuildSummary::default()
                };
                let chain_stores: FxHashSet<i64> = {
                    let mut stmt = tx.prepare("SELECT id FROM stores WHERE chain = ?1")?;
                    stmt.query_map(params![chain], |r| r.get::<_, i64>(0))?
                        .collect::<Result<_, _>>()?
                };

                tx.execute(
                    "DELETE FROM group_candidates
                     WHERE group_id IN (SELECT id FROM store_groups WHERE chain = ?1)",
                    params![chain],
                )?;
                tx.execute(
                    "DELETE FROM store_group_members
                     WHERE group_id IN (SELECT id FROM store_groups WHERE chain = ?1)",
                    params![chain],
                )?;
                summary.groups_removed =
                    tx.execute("DELETE FROM store_groups WHERE chain = ?1", params![chain])?;

                let now = time::now_epoch();
                let mut ids = ulid::Generator::new();
                let mut linked: FxHashSet<i64> = FxHashSet::default();
                for proposed in groups {
                    let mut members = Vec::with_capacity(proposed.len());
                    for &store_id in proposed {
                        let reason = if !chain_stores.contains(&store_id) {
                            Some("not a store of this chain")
                        } else if linked.contains(&store_id) {
                            Some("already assigned to another group")
                        } else {
                            None
                        };
                        match reason {
                            Some(reason) => {
                                tracing::warn!(chain, store_id, reason, "rebuild skipped member");
                                summary.skipped.push(SkippedMember {
                                    store_id,
                                    reason: reason.to_string(),
                                });
                            }
                            None => {
                                linked.insert(store_id);
                                members.push(store_id);
                            }
                        }
                    }
                    if members.is_empty() {
                        continue;
                    }
                    let id = ids
                        .generate()
                        .map_err(|e| ShelfwiseError::ValidationError(e.to_string()))?
                        .to_string();
                    insert_group(tx, &id, chain, method, &members, now)?;
                    summary.groups_created += 1;
                    summary.members_linked += members.len();
                }
                Ok(summary)
            })
            .inspect(|s| {
                tracing::info!(
                    chain,
                    method = method.as_str(),
                    removed = s.groups_removed,
                    created = s.groups_created,
                    linked = s.members_linked,
                    skipped = s.skipped.len(),
                    "chain rebuilt"
                );
            })
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<StoreGroup>, ShelfwiseError> {
        self.broker.with_read(&self.db_path, |conn| {
            let chain: Option<String> = conn
                .query_row(
                    "SELECT chain FROM store_groups WHERE id = ?1",
                    params![group_id],
                    |r| r.get(0),
                )
                .optional()?;
            match chain {
                Some(chain) => Ok(load_groups(conn, &chain, Some(group_id))?.into_iter().next()),
                None => Ok(None),
            }
        })
    }

    /// Every group of a chain (retired ones included), ordered by id.
    pub fn list_groups(&self, chain: &str) -> Result<Vec<StoreGroup>, ShelfwiseError> {
        self.broker
            .with_read(&self.db_path, |conn| load_groups(conn, chain, None))
    }

    pub fn group_of(&self, store_id: i64) -> Result<Option<String>, ShelfwiseError> {
        self.broker
            .with_read(&self.db_path, |conn| membership_of(conn, store_id))
    }

    /// Every store of `chain` acting as representative or pending candidate.
    pub fn pending_stores(&self, chain: &str) -> Result<BTreeSet<i64>, ShelfwiseError> {
        self.broker
            .with_read(&self.db_path, |conn| pending_in_chain(conn, chain))
    }
}

// ----- connection-level helpers -----

pub(crate) fn load_store(conn: &Connection, store_id: i64) -> Result<Option<Store>, ShelfwiseError> {
    let sql = format!("SELECT {} FROM stores WHERE id = ?1", STORE_COLUMNS);
    Ok(conn
        .query_row(&sql, params![store_id], Store::from_row)
        .optional()?)
}

pub(crate) fn load_prices(conn: &Connection, store_id: i64) -> Result<PriceSet, ShelfwiseError> {
    let mut stmt = conn.prepare("SELECT product_id, price FROM prices WHERE store_id = ?1")?;
    let prices = stmt
        .query_map(params![store_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<Result<PriceSet, _>>()?;
    Ok(prices)
}

fn membership_of(conn: &Connection, store_id: i64) -> Result<Option<String>, ShelfwiseError> {
    Ok(conn
        .query_row(
            "SELECT group_id FROM store_group_members WHERE store_id = ?1",
            params![store_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Representative of any group, or pending candidate of any group.
fn is_pending(conn: &Connection, store_id: i64) -> Result<bool, ShelfwiseError> {
    let n: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM store_groups WHERE representative_id = ?1)
              + (SELECT COUNT(*) FROM group_candidates WHERE store_id = ?1)",
        params![store_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub(crate) fn pending_in_chain(
    conn: &Connection,
    chain: &str,
) -> Result<BTreeSet<i64>, ShelfwiseError> {
    let mut stmt = conn.prepare(
        "SELECT representative_id FROM store_groups
         WHERE chain = ?1 AND representative_id IS NOT NULL
         UNION
         SELECT c.store_id FROM group_candidates c
         JOIN store_groups g ON g.id = c.group_id
         WHERE g.chain = ?1",
    )?;
    let ids = stmt
        .query_map(params![chain], |r| r.get::<_, i64>(0))?
        .collect::<Result<BTreeSet<i64>, _>>()?;
    Ok(ids)
}

fn group_status(conn: &Connection, group_id: &str) -> Result<GroupStatus, ShelfwiseError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM store_groups WHERE id = ?1",
            params![group_id],
            |r| r.get(0),
        )
        .optional()?;
    status
        .ok_or_else(|| ShelfwiseError::NotFound(format!("group {}", group_id)))?
        .parse()
}

fn insert_group(
    conn: &Connection,
    id: &str,
    chain: &str,
    method: GroupMethod,
    members: &[i64],
    now: i64,
) -> Result<(), ShelfwiseError> {
    conn.execute(
        "INSERT INTO store_groups(id, chain, method, status, active, representative_id, created_at, updated_at)
         VALUES(?1, ?2, ?3, 'active', 1, NULL, ?4, ?4)",
        params![id, chain, method.as_str(), now],
    )?;
    let mut stmt =
        conn.prepare("INSERT INTO store_group_members(store_id, group_id) VALUES(?1, ?2)")?;
    for store_id in members {
        stmt.execute(params![store_id, id])?;
    }
    Ok(())
}

pub(crate) fn set_representative_tx(
    conn: &Connection,
    group_id: &str,
    store_id: i64,
    now: i64,
) -> Result<(), ShelfwiseError> {
    if group_status(conn, group_id)? == GroupStatus::Retired {
        return Err(ShelfwiseError::ValidationError(format!(
            "group {} is retired",
            group_id
        )));
    }
    if membership_of(conn, store_id)?.as_deref() != Some(group_id) {
        return Err(ShelfwiseError::NotAMember {
            group_id: group_id.to_string(),
            store_id,
        });
    }
    // A promoted candidate stops being pending as a candidate.
    conn.execute(
        "DELETE FROM group_candidates WHERE group_id = ?1 AND store_id = ?2",
        params![group_id, store_id],
    )?;
    conn.execute(
        "UPDATE store_groups SET representative_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![store_id, now, group_id],
    )?;
    tracing::info!(group_id, store_id, "representative assigned");
    Ok(())
}

/// Drop every group link a store has: candidacy, representative role, membership.
fn release_store(conn: &Connection, store_id: i64) -> Result<(), ShelfwiseError> {
    conn.execute(
        "DELETE FROM group_candidates WHERE store_id = ?1",
        params![store_id],
    )?;
    conn.execute(
        "UPDATE store_groups SET representative_id = NULL WHERE representative_id = ?1",
        params![store_id],
    )?;
    conn.execute(
        "DELETE FROM store_group_members WHERE store_id = ?1",
        params![store_id],
    )?;
    Ok(())
}

fn load_groups(
    conn: &Connection,
    chain: &str,
    only: Option<&str>,
) -> Result<Vec<StoreGroup>, ShelfwiseError> {
    let mut stmt = conn.prepare(
        "SELECT id, chain, method, status, active, representative_id, created_at, updated_at
         FROM store_groups WHERE chain = ?1 AND (?2 IS NULL OR id = ?2) ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![chain, only], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<i64>>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups = Vec::with_capacity(rows.len());
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    for (id, chain, method, status, active, representative, created_at, updated_at) in rows {
        index.insert(id.clone(), groups.len());
        groups.push(StoreGroup {
            id,
            chain,
            method: method.parse()?,
            status: status.parse()?,
            active: active != 0,
            representative,
            members: Vec::new(),
            candidates: Vec::new(),
            created_at,
            updated_at,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT m.group_id, m.store_id FROM store_group_members m
         JOIN store_groups g ON g.id = m.group_id
         WHERE g.chain = ?1 AND (?2 IS NULL OR g.id = ?2)
         ORDER BY m.store_id",
    )?;
    let members = stmt.query_map(params![chain, only], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    for row in members {
        let (group_id, store_id) = row?;
        if let Some(&i) = index.get(&group_id) {
            groups[i].members.push(store_id);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT c.group_id, c.store_id, c.attempts, c.enqueued_at FROM group_candidates c
         JOIN store_groups g ON g.id = c.group_id
         WHERE g.chain = ?1 AND (?2 IS NULL OR g.id = ?2)
         ORDER BY c.enqueued_at, c.store_id",
    )?;
    let candidates = stmt.query_map(params![chain, only], |r| {
        Ok((
            r.get::<_, String>(0)?,
            Candidate {
                store_id: r.get(1)?,
                attempts: r.get(2)?,
                enqueued_at: r.get(3)?,
            },
        ))
    })?;
    for row in candidates {
        let (group_id, candidate) = row?;
        if let Some(&i) = index.get(&group_id) {
            groups[i].candidates.push(candidate);
        }
    }

    Ok(groups)
}

// ----- CLI -----

#[derive(Parser, Debug)]
#[clap(name = "groups", about = "Inspect and administer equivalence groups.")]
pub struct GroupsCli {
    #[clap(subcommand)]
    pub command: GroupsCommand,
}

#[derive(Subcommand, Debug)]
pub enum GroupsCommand {
    /// List groups of a chain with members, representative and status.
    List {
        #[clap(long)]
        chain: String,
    },
    /// Show one group.
    Show {
        #[clap(long)]
        id: String,
    },
    /// Create a manual group from explicit member ids.
    Create {
        #[clap(long)]
        chain: String,
        #[clap(long, value_delimiter = ',', required = true)]
        members: Vec<i64>,
    },
    /// Assign a group's representative.
    SetRepresentative {
        #[clap(long)]
        group: String,
        #[clap(long)]
        store: i64,
    },
    /// Retire a group, releasing its members.
    Retire {
        #[clap(long)]
        id: String,
    },
}

pub fn run_groups_cli(
    root: &Path,
    format: OutputFormat,
    cli: GroupsCli,
) -> Result<(), ShelfwiseError> {
    let registry = Registry::open(root)?;
    match cli.command {
        GroupsCommand::List { chain } => {
            let groups = registry.list_groups(&chain)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    time::command_envelope(
                        "groups.list",
                        "ok",
                        serde_json::json!({ "chain": chain, "groups": groups })
                    )
                ),
                OutputFormat::Text => print_groups(&groups),
            }
        }
        GroupsCommand::Show { id } => {
            let group = registry
                .get_group(&id)?
                .ok_or_else(|| ShelfwiseError::NotFound(format!("group {}", id)))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&group)?),
                OutputFormat::Text => print_groups(std::slice::from_ref(&group)),
            }
        }
        GroupsCommand::Create { chain, members } => {
            let id = registry.create_group(&chain, GroupMethod::Manual, &members)?;
            println!(
                "{}",
                time::command_envelope("groups.create", "ok", serde_json::json!({ "id": id }))
            );
        }
        GroupsCommand::SetRepresentative { group, store } => {
            registry.set_representative(&group, store)?;
            println!(
                "{}",
                time::command_envelope(
                    "groups.set_representative",
                    "ok",
                    serde_json::json!({ "id": group, "representative": store })
                )
            );
        }
        GroupsCommand::Retire { id } => {
            registry.retire_group(&id)?;
            println!(
                "{}",
                time::command_envelope("groups.retire", "ok", serde_json::json!({ "id": id }))
            );
        }
    }
    Ok(())
}

fn print_groups(groups: &[StoreGroup]) {
    if groups.is_empty() {
        println!("No groups found.");
        return;
    }
    for g in groups {
        let status = match g.status {
            GroupStatus::Active => "ACTIVE".green(),
            GroupStatus::DivergenceDetected => "DIVERGENCE_DETECTED".red().bold(),
            GroupStatus::Retired => "RETIRED".dimmed(),
        };
        println!("{} [{}] {}", g.id.bold(), g.method, status);
        println!(
            "  representative: {}",
            g.representative
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        println!(
            "  members ({}): {}",
            g.members.len(),
            output::preview_ids(&g.members, 12)
        );
        if !g.candidates.is_empty() {
            let ids: Vec<i64> = g.candidates.iter().map(|c| c.store_id).collect();
            println!("  candidates: {}", output::preview_ids(&ids, 12));
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "groups",
        "version": "0.1.0",
        "description": "Equivalence registry of store groups",
        "commands": [
            { "name": "list", "parameters": ["chain"] },
            { "name": "show", "parameters": ["id"] },
            { "name": "create", "parameters": ["chain", "members"] },
            { "name": "set-representative", "parameters": ["group", "store"] },
            { "name": "retire", "parameters": ["id"] }
        ],
        "storage": ["registry.db"]
    })
}
