//! Adaptive scrape scheduling.
//!
//! `next_candidate` picks a group for the chain (divergence first, otherwise the
//! largest group, a random other group, or the ungrouped outliers), orders that
//! pool by priority and leases the first store nobody else holds. The lease is a
//! conditional UPDATE, so concurrent workers in different processes never receive
//! the same store while its lease is live. Nothing is kept between calls.

use crate::core::config::{Config, SchedulerConfig};
use crate::core::error::ShelfwiseError;
use crate::core::output::{self, OutputFormat};
use crate::core::store::{ScrapeState, Store};
use crate::core::time;
use crate::plugins::divergence::{DivergenceMonitor, MonitorOutcome};
use crate::plugins::registry::{self, GroupStatus, Registry, StoreGroup};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::Rng;
use rusqlite::params;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

const ACTOR: &str = "scheduler";

/// Why a store was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickReason {
    DivergenceCandidate,
    RepresentativeRefresh,
    GroupMember,
    Outlier,
}

/// A leased store, ready to be scraped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub store: Store,
    pub token: String,
    pub leased_at: i64,
    pub expires_at: i64,
    pub group_id: Option<String>,
    pub reason: PickReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub store_id: i64,
    pub outcome: ScrapeOutcome,
    pub lease_released: bool,
    pub monitor: Option<MonitorOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub store_id: i64,
    pub state: ScrapeState,
    pub group_id: Option<String>,
    pub representative: bool,
    pub leased_until: Option<i64>,
    pub last_scraped: Option<i64>,
}

/// Which pool a call draws from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GroupPick<'g> {
    Group(&'g StoreGroup),
    Outliers,
}

/// Choose the pool for one call.
///
/// A diverged group pre-empts everything. Otherwise the configured weights split
/// between the largest group, a uniformly random other group and the outliers.
/// No live group means outliers.
pub fn pick_group<'g, R: Rng + ?Sized>(
    groups: &'g [StoreGroup],
    weights: &SchedulerConfig,
    rng: &mut R,
) -> GroupPick<'g> {
    let live: Vec<&StoreGroup> = groups
        .iter()
        .filter(|g| g.active && g.status != GroupStatus::Retired && !g.members.is_empty())
        .collect();
    if let Some(g) = live
        .iter()
        .copied()
        .find(|g| g.status == GroupStatus::DivergenceDetected)
    {
        return GroupPick::Group(g);
    }
    let Some(largest) = live
        .iter()
        .copied()
        .min_by(|a, b| b.members.len().cmp(&a.members.len()).then(a.id.cmp(&b.id)))
    else {
        return GroupPick::Outliers;
    };

    let roll: f64 = rng.r#gen();
    if roll < weights.exploit_weight {
        GroupPick::Group(largest)
    } else if roll < weights.exploit_weight + weights.explore_groups_weight {
        let others: Vec<&StoreGroup> = live
            .iter()
            .copied()
            .filter(|g| g.id != largest.id)
            .collect();
        if others.is_empty() {
            GroupPick::Group(largest)
        } else {
            GroupPick::Group(others[rng.gen_range(0..others.len())])
        }
    } else {
        GroupPick::Outliers
    }
}

/// Priority order: never scraped, then flagged, then oldest scrape; lowest id
/// breaks ties.
pub fn prioritize(pool: &mut [&Store]) {
    pool.sort_by_key(|s| {
        let class = match (s.last_scraped, s.needs_rescraping) {
            (None, _) => 0u8,
            (Some(_), true) => 1,
            (Some(_), false) => 2,
        };
        (class, s.last_scraped.unwrap_or(i64::MIN), s.id)
    });
}

pub struct Scheduler<'a> {
    registry: &'a Registry,
    config: &'a Config,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a Registry, config: &'a Config) -> Self {
        Self { registry, config }
    }

    /// Lease the next store to scrape for `chain`, or `None` when nothing is
    /// eligible right now.
    pub fn next_candidate(&self, chain: &str) -> Result<Option<Lease>, ShelfwiseError> {
        self.next_candidate_at(chain, time::now_epoch(), &mut rand::thread_rng())
    }

    pub fn next_candidate_at<R: Rng + ?Sized>(
        &self,
        chain: &str,
        now: i64,
        rng: &mut R,
    ) -> Result<Option<Lease>, ShelfwiseError> {
        let sched = &self.config.scheduler;
        let mut groups = self.registry.list_groups(chain)?;
        let stores = self.registry.list_stores(chain)?;
        let by_id: FxHashMap<i64, &Store> = stores.iter().map(|s| (s.id, s)).collect();
        let excluded = self.config.non_representative_divisions(chain);

        // A diverged group pre-empts the chain; it must not wait on candidates
        // nobody can scrape.
        let monitor = self.monitor(chain, now);
        for group in groups.iter_mut() {
            let stuck = group.status == GroupStatus::DivergenceDetected
                && group
                    .candidates
                    .iter()
                    .any(|c| !by_id.get(&c.store_id).is_some_and(|s| s.active));
            if stuck {
                *group = monitor.prune_candidates(group.clone())?;
            }
        }
        let pending = self.registry.pending_stores(chain)?;

        let pick = pick_group(&groups, sched, rng);
        let mut lanes: Vec<(PickReason, Vec<&Store>)> = Vec::new();
        let group_id = match pick {
            GroupPick::Group(group) => {
                if group.status == GroupStatus::DivergenceDetected {
                    let mut candidates: Vec<&Store> = group
                        .candidates
                        .iter()
                        .filter_map(|c| by_id.get(&c.store_id).copied())
                        .filter(|s| s.active)
                        .collect();
                    prioritize(&mut candidates);
                    lanes.push((PickReason::DivergenceCandidate, candidates));
                }
                if let Some(rep) = group
                    .representative
                    .and_then(|id| by_id.get(&id).copied())
                    .filter(|s| self.representative_due(s, now))
                {
                    lanes.push((PickReason::RepresentativeRefresh, vec![rep]));
                }
                let mut members: Vec<&Store> = group
                    .members
                    .iter()
                    .filter_map(|id| by_id.get(id).copied())
                    .filter(|s| eligible(s, &pending, excluded))
                    .collect();
                prioritize(&mut members);
                lanes.push((PickReason::GroupMember, members));
                Some(group.id.clone())
            }
            GroupPick::Outliers => {
                let grouped: FxHashSet<i64> = groups
                    .iter()
                    .flat_map(|g| g.members.iter().copied())
                    .collect();
                let mut outliers: Vec<&Store> = stores
                    .iter()
                    .filter(|s| !grouped.contains(&s.id) && eligible(s, &pending, excluded))
                    .collect();
                prioritize(&mut outliers);
                lanes.push((PickReason::Outlier, outliers));
                None
            }
        };

        let mut tried: FxHashSet<i64> = FxHashSet::default();
        for (reason, lane) in lanes {
            for store in lane {
                if !tried.insert(store.id) || store.is_leased(now, sched.lease_ttl_secs) {
                    continue;
                }
                if let Some(lease) = self.try_acquire(store.id, now)? {
                    tracing::info!(
                        chain,
                        store_id = store.id,
                        reason = ?reason,
                        group_id = group_id.as_deref().unwrap_or("-"),
                        "store leased"
                    );
                    return Ok(Some(Lease {
                        group_id: group_id.clone(),
                        reason,
                        ..lease
                    }));
                }
                tracing::debug!(chain, store_id = store.id, "lease race lost, falling through");
            }
        }
        tracing::debug!(chain, "no eligible store");
        Ok(None)
    }

    fn representative_due(&self, rep: &Store, now: i64) -> bool {
        rep.active
            && (rep.last_scraped.is_none()
                || rep.needs_rescraping
                || rep.last_scraped.is_some_and(|ts| {
                    now - ts >= self.config.scheduler.representative_refresh_secs
                }))
    }

    /// Atomically take the lease for `store_id`; `None` means someone else holds it.
    fn try_acquire(&self, store_id: i64, now: i64) -> Result<Option<Lease>, ShelfwiseError> {
        let ttl = self.config.scheduler.lease_ttl_secs;
        let token = ulid::Ulid::new().to_string();
        let store = self.registry.broker().with_tx(
            self.registry.db_path(),
            ACTOR,
            "scheduler.lease",
            |tx| {
                let n = tx.execute(
                    "UPDATE stores SET scheduled_at = ?1, lease_token = ?2
                     WHERE id = ?3 AND active = 1
                       AND (scheduled_at IS NULL OR scheduled_at <= ?1 - ?4)",
                    params![now, token, store_id, ttl],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                registry::load_store(tx, store_id)
            },
        )?;
        Ok(store.map(|store| Lease {
            store,
            token,
            leased_at: now,
            expires_at: now + ttl,
            group_id: None,
            reason: PickReason::Outlier,
        }))
    }

    /// Scrape-outcome callback.
    ///
    /// Success stamps `last_scraped` and clears `needs_rescraping`. The lease is
    /// released only when `token` matches the current holder (or no token is given).
    /// After a success the divergence monitor runs for the store; a failure only
    /// matters to it when the store is a pending candidate.
    pub fn report_outcome(
        &self,
        store_id: i64,
        token: Option<&str>,
        outcome: ScrapeOutcome,
    ) -> Result<OutcomeReport, ShelfwiseError> {
        self.report_outcome_at(store_id, token, outcome, time::now_epoch())
    }

    pub fn report_outcome_at(
        &self,
        store_id: i64,
        token: Option<&str>,
        outcome: ScrapeOutcome,
        now: i64,
    ) -> Result<OutcomeReport, ShelfwiseError> {
        let (chain, lease_released) = self.registry.broker().with_tx(
            self.registry.db_path(),
            ACTOR,
            "scheduler.outcome",
            |tx| {
                let store = registry::load_store(tx, store_id)?
                    .ok_or_else(|| ShelfwiseError::NotFound(format!("store {}", store_id)))?;
                if outcome == ScrapeOutcome::Success {
                    tx.execute(
                        "UPDATE stores SET last_scraped = ?1, needs_rescraping = 0 WHERE id = ?2",
                        params![now, store_id],
                    )?;
                }
                let holder_matches = match token {
                    None => true,
                    Some(t) => store.lease_token.as_deref() == Some(t),
                };
                if holder_matches {
                    tx.execute(
                        "UPDATE stores SET scheduled_at = NULL, lease_token = NULL WHERE id = ?1",
                        params![store_id],
                    )?;
                }
                Ok((store.chain, holder_matches))
            },
        )?;
        if !lease_released {
            tracing::warn!(store_id, "outcome reported with a stale lease token; lease kept");
        }

        let divergence = self.monitor(&chain, now);
        let monitor = match outcome {
            ScrapeOutcome::Success => Some(divergence.observe_scrape(store_id)?),
            ScrapeOutcome::Failure => divergence.observe_failure(store_id)?,
        };
        Ok(OutcomeReport {
            store_id,
            outcome,
            lease_released,
            monitor,
        })
    }

    fn monitor(&self, chain: &str, now: i64) -> DivergenceMonitor<'a> {
        DivergenceMonitor::new(
            self.registry,
            &self.config.divergence,
            self.config.non_representative_divisions(chain),
        )
        .at(now)
    }

    /// Per-store scheduling state for a chain, ascending id.
    pub fn chain_status(&self, chain: &str, now: i64) -> Result<Vec<StoreStatus>, ShelfwiseError> {
        let sched = &self.config.scheduler;
        let groups = self.registry.list_groups(chain)?;
        let mut membership: FxHashMap<i64, (&str, bool)> = FxHashMap::default();
        for g in &groups {
            for &m in &g.members {
                membership.insert(m, (g.id.as_str(), g.representative == Some(m)));
            }
        }
        Ok(self
            .registry
            .list_stores(chain)?
            .into_iter()
            .map(|s| {
                let link = membership.get(&s.id);
                StoreStatus {
                    store_id: s.id,
                    state: s.scrape_state(now, sched.stale_after_secs),
                    group_id: link.map(|(g, _)| g.to_string()),
                    representative: link.is_some_and(|(_, rep)| *rep),
                    leased_until: s
                        .is_leased(now, sched.lease_ttl_secs)
                        .then(|| s.lease_expires_at(sched.lease_ttl_secs))
                        .flatten(),
                    last_scraped: s.last_scraped,
                }
            })
            .collect())
    }
}

fn eligible(store: &Store, pending: &BTreeSet<i64>, excluded: &[String]) -> bool {
    store.active && !pending.contains(&store.id) && !excluded.contains(&store.division)
}

// ----- CLI -----

#[derive(Parser, Debug)]
#[clap(name = "schedule", about = "Hand out scrape leases and record outcomes.")]
pub struct ScheduleCli {
    #[clap(subcommand)]
    pub command: ScheduleCommand,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Lease the next store to scrape for a chain.
    Next {
        #[clap(long)]
        chain: String,
    },
    /// Report a finished scrape and release its lease.
    Complete {
        #[clap(long)]
        store: i64,
        /// Lease token returned by `next`.
        #[clap(long)]
        token: Option<String>,
        /// The scrape failed; only the lease is released.
        #[clap(long)]
        failed: bool,
    },
    /// Flag a store for rescraping.
    Flag {
        #[clap(long)]
        store: i64,
    },
    /// Show the scrape state of every store in a chain.
    Status {
        #[clap(long)]
        chain: String,
    },
}

pub fn run_schedule_cli(
    root: &Path,
    config: &Config,
    format: OutputFormat,
    cli: ScheduleCli,
) -> Result<(), ShelfwiseError> {
    let registry = Registry::open(root)?;
    let scheduler = Scheduler::new(&registry, config);
    match cli.command {
        ScheduleCommand::Next { chain } => {
            let envelope = match scheduler.next_candidate(&chain)? {
                Some(lease) => time::command_envelope(
                    "schedule.next",
                    "ok",
                    serde_json::json!({
                        "store_id": lease.store.id,
                        "lease_token": lease.token,
                        "lease_expires_at": lease.expires_at,
                        "group_id": lease.group_id,
                        "reason": lease.reason,
                    }),
                ),
                None => time::command_envelope(
                    "schedule.next",
                    "none",
                    serde_json::json!({ "chain": chain }),
                ),
            };
            println!("{}", envelope);
        }
        ScheduleCommand::Complete {
            store,
            token,
            failed,
        } => {
            let outcome = if failed {
                ScrapeOutcome::Failure
            } else {
                ScrapeOutcome::Success
            };
            let report = scheduler.report_outcome(store, token.as_deref(), outcome)?;
            println!(
                "{}",
                time::command_envelope(
                    "schedule.complete",
                    "ok",
                    serde_json::to_value(&report)?
                )
            );
        }
        ScheduleCommand::Flag { store } => {
            registry.set_needs_rescraping(store, true)?;
            println!(
                "{}",
                time::command_envelope(
                    "schedule.flag",
                    "ok",
                    serde_json::json!({ "store_id": store })
                )
            );
        }
        ScheduleCommand::Status { chain } => {
            let now = time::now_epoch();
            let rows = scheduler.chain_status(&chain, now)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    time::command_envelope(
                        "schedule.status",
                        "ok",
                        serde_json::json!({ "chain": chain, "stores": rows })
                    )
                ),
                OutputFormat::Text => {
                    for r in rows {
                        let state = match r.state {
                            ScrapeState::NeverScraped => r.state.as_str().yellow(),
                            ScrapeState::Scraped => r.state.as_str().green(),
                            ScrapeState::Stale => r.state.as_str().red(),
                            ScrapeState::Flagged => r.state.as_str().magenta(),
                        };
                        println!(
                            "{:>8} {:<14} {:<10} {}{}",
                            r.store_id,
                            state,
                            output::age(r.last_scraped, now),
                            r.group_id.as_deref().unwrap_or("-"),
                            if r.representative { " (rep)" } else { "" }
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "schedule",
        "version": "0.1.0",
        "description": "Adaptive scrape scheduler with time-boxed leases",
        "commands": [
            { "name": "next", "parameters": ["chain"] },
            { "name": "complete", "parameters": ["store", "token", "failed"] },
            { "name": "flag", "parameters": ["store"] },
            { "name": "status", "parameters": ["chain"] }
        ],
        "storage": ["registry.db"]
    })
}
