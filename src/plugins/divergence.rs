//! Closed-loop validation of group representatives.
//!
//! After a scrape the monitor compares the scraped store's latest prices with its
//! group: a representative is checked against a sample of recently scraped members,
//! a plain member against the representative. A mismatch beyond tolerance flags the
//! group and queues the diverging members as candidates. Each candidate scrape either
//! confirms the representative (candidate dropped, group back to ACTIVE once the
//! queue drains) or counts a miss; at `max_attempts` misses the candidate becomes the
//! new representative. Failed scrapes of a candidate count against the same
//! attempt budget; a candidate that exhausts it without a usable scrape is dropped.
//! Candidates that went inactive or left the group are dropped as soon as the
//! group is looked at. Membership is never touched here.

use crate::core::config::DivergenceConfig;
use crate::core::error::ShelfwiseError;
use crate::core::time;
use crate::plugins::registry::{GroupStatus, PriceSet, Registry, StoreGroup};
use serde::{Deserialize, Serialize};

/// Common-product comparison between two price sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceComparison {
    pub common: usize,
    pub differing: usize,
}

impl PriceComparison {
    pub fn between(a: &PriceSet, b: &PriceSet) -> PriceComparison {
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        let mut cmp = PriceComparison::default();
        for (product, price) in small {
            if let Some(other) = large.get(product) {
                cmp.common += 1;
                if price.to_bits() != other.to_bits() {
                    cmp.differing += 1;
                }
            }
        }
        cmp
    }

    /// `None` when too few products overlap to judge.
    pub fn within_tolerance(&self, config: &DivergenceConfig) -> Option<bool> {
        if self.common == 0 || self.common < config.min_common_products {
            return None;
        }
        Some(self.differing as f64 / self.common as f64 <= config.tolerance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MonitorOutcome {
    /// The store is not in any live group.
    Ungrouped,
    /// Nothing comparable yet (no representative prices, no overlap, no samples).
    Inconclusive { group_id: String },
    /// The store may not stand in for its chain's main banner.
    Ineligible { group_id: String },
    RepresentativeAdopted { group_id: String, store_id: i64 },
    Consistent { group_id: String, compared: usize },
    DivergenceFlagged { group_id: String, candidates: Vec<i64> },
    CandidateConfirmed { group_id: String, store_id: i64, group_restored: bool },
    CandidateMissed { group_id: String, store_id: i64, attempts: u32 },
    /// Attempts ran out without a scrape that could be compared.
    CandidateDropped {
        group_id: String,
        store_id: i64,
        attempts: u32,
        group_restored: bool,
    },
    RepresentativePromoted {
        group_id: String,
        store_id: i64,
        previous: Option<i64>,
        group_restored: bool,
    },
}

pub struct DivergenceMonitor<'a> {
    registry: &'a Registry,
    config: &'a DivergenceConfig,
    excluded_divisions: &'a [String],
    now: i64,
}

impl<'a> DivergenceMonitor<'a> {
    pub fn new(
        registry: &'a Registry,
        config: &'a DivergenceConfig,
        excluded_divisions: &'a [String],
    ) -> Self {
        Self {
            registry,
            config,
            excluded_divisions,
            now: time::now_epoch(),
        }
    }

    /// Stamp registry changes with `now` instead of the wall clock.
    pub fn at(self, now: i64) -> Self {
        Self { now, ..self }
    }

    /// React to a completed scrape of `store_id`.
    pub fn observe_scrape(&self, store_id: i64) -> Result<MonitorOutcome, ShelfwiseError> {
        let Some(group) = self.live_group(store_id)? else {
            return Ok(MonitorOutcome::Ungrouped);
        };
        let group = self.prune_candidates(group)?;

        if group.candidate(store_id).is_some() {
            return self.validate_candidate(&group, store_id);
        }
        match group.representative {
            Some(rep) if rep == store_id => self.check_representative(&group, rep),
            Some(rep) => self.check_member(&group, rep, store_id),
            None => self.adopt(&group, store_id),
        }
    }

    /// React to a failed scrape of `store_id`. Only candidates are affected; `None`
    /// for everyone else.
    pub fn observe_failure(&self, store_id: i64) -> Result<Option<MonitorOutcome>, ShelfwiseError> {
        let Some(group) = self.live_group(store_id)? else {
            return Ok(None);
        };
        if group.candidate(store_id).is_none() {
            return Ok(None);
        }
        let attempts = self.registry.record_candidate_miss(&group.id, store_id)?;
        if attempts < self.config.max_attempts {
            return Ok(Some(MonitorOutcome::CandidateMissed {
                group_id: group.id.clone(),
                store_id,
                attempts,
            }));
        }
        self.registry.remove_candidate(&group.id, store_id)?;
        let group_restored = self.restore_if_drained(&group, store_id)?;
        tracing::warn!(group_id = %group.id, store_id, attempts, "candidate dropped after failed scrapes");
        Ok(Some(MonitorOutcome::CandidateDropped {
            group_id: group.id.clone(),
            store_id,
            attempts,
            group_restored,
        }))
    }

    /// Drop candidates that can no longer be scraped (inactive, unknown, or no
    /// longer members) and restore the group when that empties its queue.
    /// Returns the group as stored afterwards.
    pub fn prune_candidates(&self, group: StoreGroup) -> Result<StoreGroup, ShelfwiseError> {
        let mut dropped = Vec::new();
        for c in &group.candidates {
            let reachable = group.has_member(c.store_id)
                && self
                    .registry
                    .get_store(c.store_id)?
                    .is_some_and(|s| s.active);
            if !reachable {
                dropped.push(c.store_id);
            }
        }
        if dropped.is_empty() {
            return Ok(group);
        }
        for &store_id in &dropped {
            self.registry.remove_candidate(&group.id, store_id)?;
            tracing::warn!(group_id = %group.id, store_id, "unreachable candidate dropped");
        }
        if group.status == GroupStatus::DivergenceDetected && dropped.len() == group.candidates.len() {
            self.registry.mark_active_at(&group.id, self.now)?;
        }
        self.registry
            .get_group(&group.id)?
            .ok_or_else(|| ShelfwiseError::NotFound(format!("group {}", group.id)))
    }

    /// The non-retired group `store_id` belongs to.
    fn live_group(&self, store_id: i64) -> Result<Option<StoreGroup>, ShelfwiseError> {
        let Some(group_id) = self.registry.group_of(store_id)? else {
            return Ok(None);
        };
        let group = self
            .registry
            .get_group(&group_id)?
            .ok_or_else(|| ShelfwiseError::NotFound(format!("group {}", group_id)))?;
        Ok(Some(group).filter(|g| g.status != GroupStatus::Retired))
    }

    fn adopt(&self, group: &StoreGroup, store_id: i64) -> Result<MonitorOutcome, ShelfwiseError> {
        let eligible = self
            .registry
            .get_store(store_id)?
            .is_some_and(|s| !self.excluded_divisions.contains(&s.division));
        if !eligible {
            return Ok(MonitorOutcome::Ineligible {
                group_id: group.id.clone(),
            });
        }
        self.registry
            .set_representative_at(&group.id, store_id, self.now)?;
        Ok(MonitorOutcome::RepresentativeAdopted {
            group_id: group.id.clone(),
            store_id,
        })
    }

    fn check_representative(
        &self,
        group: &StoreGroup,
        rep: i64,
    ) -> Result<MonitorOutcome, ShelfwiseError> {
        let rep_prices = self.registry.latest_prices(rep)?;
        let mut compared = 0;
        let mut diverging = Vec::new();
        for member in self.sample_members(group, rep)? {
            let prices = self.registry.latest_prices(member)?;
            match PriceComparison::between(&rep_prices, &prices).within_tolerance(self.config) {
                Some(true) => compared += 1,
                Some(false) => {
                    compared += 1;
                    diverging.push(member);
                }
                None => {}
            }
        }

        if !diverging.is_empty() {
            return self.flag(group, &diverging);
        }
        if compared == 0 {
            return Ok(MonitorOutcome::Inconclusive {
                group_id: group.id.clone(),
            });
        }
        // A flagged group whose queue never filled is cleared by a clean check.
        if group.status == GroupStatus::DivergenceDetected && group.candidates.is_empty() {
            self.registry.mark_active_at(&group.id, self.now)?;
        }
        Ok(MonitorOutcome::Consistent {
            group_id: group.id.clone(),
            compared,
        })
    }

    fn check_member(
        &self,
        group: &StoreGroup,
        rep: i64,
        store_id: i64,
    ) -> Result<MonitorOutcome, ShelfwiseError> {
        let cmp = PriceComparison::between(
            &self.registry.latest_prices(rep)?,
            &self.registry.latest_prices(store_id)?,
        );
        match cmp.within_tolerance(self.config) {
            None => Ok(MonitorOutcome::Inconclusive {
                group_id: group.id.clone(),
            }),
            Some(true) => Ok(MonitorOutcome::Consistent {
                group_id: group.id.clone(),
                compared: 1,
            }),
            Some(false) => self.flag(group, &[store_id]),
        }
    }

    fn flag(&self, group: &StoreGroup, diverging: &[i64]) -> Result<MonitorOutcome, ShelfwiseError> {
        tracing::warn!(
            group_id = %group.id,
            diverging = diverging.len(),
            "representative diverged from group members"
        );
        self.registry.flag_divergence_at(&group.id, self.now)?;
        let mut queued = Vec::new();
        for &member in diverging.iter().take(self.config.max_candidates) {
            match self.registry.add_candidate_at(&group.id, member, self.now) {
                Ok(()) => queued.push(member),
                Err(e) if e.is_invariant_violation() => {
                    tracing::warn!(group_id = %group.id, store_id = member, error = %e, "candidate skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(MonitorOutcome::DivergenceFlagged {
            group_id: group.id.clone(),
            candidates: queued,
        })
    }

    fn validate_candidate(
        &self,
        group: &StoreGroup,
        store_id: i64,
    ) -> Result<MonitorOutcome, ShelfwiseError> {
        let Some(rep) = group.representative else {
            return self.promote(group, store_id, None);
        };
        let cmp = PriceComparison::between(
            &self.registry.latest_prices(rep)?,
            &self.registry.latest_prices(store_id)?,
        );
        match cmp.within_tolerance(self.config) {
            None => Ok(MonitorOutcome::Inconclusive {
                group_id: group.id.clone(),
            }),
            Some(true) => {
                self.registry.remove_candidate(&group.id, store_id)?;
                let group_restored = self.restore_if_drained(group, store_id)?;
                tracing::info!(group_id = %group.id, store_id, "candidate confirmed representative");
                Ok(MonitorOutcome::CandidateConfirmed {
                    group_id: group.id.clone(),
                    store_id,
                    group_restored,
                })
            }
            Some(false) => {
                let attempts = self.registry.record_candidate_miss(&group.id, store_id)?;
                if attempts >= self.config.max_attempts {
                    return self.promote(group, store_id, Some(rep));
                }
                self.registry.set_needs_rescraping(store_id, true)?;
                Ok(MonitorOutcome::CandidateMissed {
                    group_id: group.id.clone(),
                    store_id,
                    attempts,
                })
            }
        }
    }

    fn promote(
        &self,
        group: &StoreGroup,
        store_id: i64,
        previous: Option<i64>,
    ) -> Result<MonitorOutcome, ShelfwiseError> {
        self.registry
            .set_representative_at(&group.id, store_id, self.now)?;
        self.registry.set_needs_rescraping(store_id, false)?;
        let group_restored = self.restore_if_drained(group, store_id)?;
        tracing::warn!(group_id = %group.id, store_id, ?previous, "candidate promoted to representative");
        Ok(MonitorOutcome::RepresentativePromoted {
            group_id: group.id.clone(),
            store_id,
            previous,
            group_restored,
        })
    }

    /// Back to ACTIVE once no candidate other than `resolved` is pending.
    fn restore_if_drained(&self, group: &StoreGroup, resolved: i64) -> Result<bool, ShelfwiseError> {
        let remaining = group
            .candidates
            .iter()
            .filter(|c| c.store_id != resolved)
            .count();
        if remaining == 0 && group.status == GroupStatus::DivergenceDetected {
            self.registry.mark_active_at(&group.id, self.now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Most recently scraped members other than the representative and pending
    /// candidates, newest first, ties on lowest id.
    fn sample_members(&self, group: &StoreGroup, rep: i64) -> Result<Vec<i64>, ShelfwiseError> {
        let mut scraped: Vec<(i64, i64)> = self
            .registry
            .list_stores(&group.chain)?
            .into_iter()
            .filter(|s| s.id != rep && group.has_member(s.id) && group.candidate(s.id).is_none())
            .filter_map(|s| s.last_scraped.map(|ts| (s.id, ts)))
            .collect();
        scraped.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scraped
            .into_iter()
            .take(self.config.sample_size)
            .map(|(id, _)| id)
            .collect())
    }
}
