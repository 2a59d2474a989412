use shelfwise::core::config::{Config, DivergenceConfig};
use shelfwise::plugins::divergence::{DivergenceMonitor, MonitorOutcome};
use shelfwise::plugins::registry::{
    GroupMethod, GroupStatus, PriceObservation, Registry, StoreRecord,
};
use shelfwise::plugins::scheduler::{ScrapeOutcome, Scheduler};
use tempfile::tempdir;

const PRODUCTS: usize = 40;

fn store(id: i64, division: &str) -> StoreRecord {
    StoreRecord {
        id,
        chain: "acme".to_string(),
        division: division.to_string(),
        latitude: None,
        longitude: None,
        active: true,
    }
}

/// Record a full basket for `store_id`; `offset` shifts every price.
fn basket(registry: &Registry, store_id: i64, offset: f64, at: i64) {
    let obs: Vec<PriceObservation> = (0..PRODUCTS)
        .map(|p| PriceObservation {
            store_id,
            product_id: format!("sku-{p:03}"),
            price: 1.0 + p as f64 * 0.25 + offset,
            observed_at: at,
        })
        .collect();
    registry.record_prices(&obs).unwrap();
}

struct Fixture {
    _tmp: tempfile::TempDir,
    registry: Registry,
    config: Config,
    group: String,
}

/// Group {1, 2, 3, 4} with representative 1; store 2 prices differently.
fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    registry
        .upsert_stores(&[store(1, ""), store(2, ""), store(3, ""), store(4, "")])
        .unwrap();
    let group = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2, 3, 4])
        .unwrap();
    registry.set_representative(&group, 1).unwrap();
    for id in [1, 3, 4] {
        basket(&registry, id, 0.0, 10);
    }
    basket(&registry, 2, 0.5, 10);
    Fixture {
        _tmp: tmp,
        registry,
        config: Config::default(),
        group,
    }
}

fn scrape(f: &Fixture, store_id: i64, at: i64) -> MonitorOutcome {
    Scheduler::new(&f.registry, &f.config)
        .report_outcome_at(store_id, None, ScrapeOutcome::Success, at)
        .unwrap()
        .monitor
        .unwrap()
}

#[test]
fn consistent_member_keeps_group_active() {
    let f = fixture();
    assert_eq!(
        scrape(&f, 3, 100),
        MonitorOutcome::Consistent {
            group_id: f.group.clone(),
            compared: 1
        }
    );
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Active);
}

#[test]
fn diverging_member_flags_group_and_queues_candidate() {
    let f = fixture();
    assert_eq!(
        scrape(&f, 2, 100),
        MonitorOutcome::DivergenceFlagged {
            group_id: f.group.clone(),
            candidates: vec![2]
        }
    );
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::DivergenceDetected);
    assert_eq!(group.candidate(2).unwrap().attempts, 0);
    // Membership is untouched.
    assert_eq!(group.members, vec![1, 2, 3, 4]);
    assert_eq!(group.representative, Some(1));
}

#[test]
fn representative_scrape_samples_recent_members() {
    let f = fixture();
    scrape(&f, 3, 100);
    scrape(&f, 4, 110);
    // Store 2 was never scraped successfully, so it is not sampled.
    let monitor = DivergenceMonitor::new(&f.registry, &f.config.divergence, &[]);
    assert_eq!(
        monitor.observe_scrape(1).unwrap(),
        MonitorOutcome::Consistent {
            group_id: f.group.clone(),
            compared: 2
        }
    );
}

#[test]
fn confirmed_candidate_restores_group() {
    let f = fixture();
    scrape(&f, 2, 100);
    // The store's prices moved back in line with the representative.
    basket(&f.registry, 2, 0.0, 200);
    assert_eq!(
        scrape(&f, 2, 200),
        MonitorOutcome::CandidateConfirmed {
            group_id: f.group.clone(),
            store_id: 2,
            group_restored: true
        }
    );
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Active);
    assert!(group.candidates.is_empty());
    assert_eq!(group.representative, Some(1));
}

#[test]
fn repeated_misses_promote_candidate() {
    let f = fixture();
    scrape(&f, 2, 100);
    for attempt in 1..3 {
        assert_eq!(
            scrape(&f, 2, 100 + attempt as i64),
            MonitorOutcome::CandidateMissed {
                group_id: f.group.clone(),
                store_id: 2,
                attempts: attempt
            }
        );
        // A miss asks for another scrape.
        assert!(f.registry.get_store(2).unwrap().unwrap().needs_rescraping);
    }
    assert_eq!(
        scrape(&f, 2, 200),
        MonitorOutcome::RepresentativePromoted {
            group_id: f.group.clone(),
            store_id: 2,
            previous: Some(1),
            group_restored: true
        }
    );
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.representative, Some(2));
    assert_eq!(group.status, GroupStatus::Active);
    assert!(group.candidates.is_empty());
    assert_eq!(group.members, vec![1, 2, 3, 4]);
}

#[test]
fn representative_divergence_queues_at_most_max_candidates() {
    let f = fixture();
    scrape(&f, 3, 100);
    scrape(&f, 4, 110);
    // Both sampled members drift after their last scrape.
    basket(&f.registry, 3, 0.75, 120);
    basket(&f.registry, 4, 1.0, 120);

    let strict = DivergenceConfig {
        max_candidates: 1,
        ..DivergenceConfig::default()
    };
    let monitor = DivergenceMonitor::new(&f.registry, &strict, &[]);
    assert_eq!(
        monitor.observe_scrape(1).unwrap(),
        MonitorOutcome::DivergenceFlagged {
            group_id: f.group.clone(),
            candidates: vec![4]
        }
    );
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::DivergenceDetected);
    assert_eq!(
        group.candidates.iter().map(|c| c.store_id).collect::<Vec<_>>(),
        vec![4]
    );
}

#[test]
fn clean_representative_check_clears_empty_flag() {
    let f = fixture();
    scrape(&f, 3, 100);
    f.registry.flag_divergence(&f.group).unwrap();
    let monitor = DivergenceMonitor::new(&f.registry, &f.config.divergence, &[]);
    assert_eq!(
        monitor.observe_scrape(1).unwrap(),
        MonitorOutcome::Consistent {
            group_id: f.group.clone(),
            compared: 1
        }
    );
    assert_eq!(
        f.registry.get_group(&f.group).unwrap().unwrap().status,
        GroupStatus::Active
    );
}

#[test]
fn first_scraped_member_is_adopted_unless_excluded() {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    registry
        .upsert_stores(&[store(1, "express"), store(2, "")])
        .unwrap();
    let group = registry
        .create_group("acme", GroupMethod::Geo, &[1, 2])
        .unwrap();
    let config = DivergenceConfig::default();
    let excluded = vec!["express".to_string()];
    let monitor = DivergenceMonitor::new(&registry, &config, &excluded);

    assert_eq!(
        monitor.observe_scrape(1).unwrap(),
        MonitorOutcome::Ineligible {
            group_id: group.clone()
        }
    );
    assert_eq!(
        monitor.observe_scrape(2).unwrap(),
        MonitorOutcome::RepresentativeAdopted {
            group_id: group.clone(),
            store_id: 2
        }
    );
    assert_eq!(
        registry.get_group(&group).unwrap().unwrap().representative,
        Some(2)
    );
}

#[test]
fn ungrouped_store_is_ignored() {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    registry.upsert_stores(&[store(1, "")]).unwrap();
    let config = DivergenceConfig::default();
    let monitor = DivergenceMonitor::new(&registry, &config, &[]);
    assert_eq!(monitor.observe_scrape(1).unwrap(), MonitorOutcome::Ungrouped);
}

#[test]
fn representative_scrape_drops_inactive_candidates() {
    let f = fixture();
    f.registry.flag_divergence(&f.group).unwrap();
    f.registry.add_candidate(&f.group, 2).unwrap();
    f.registry
        .upsert_stores(&[StoreRecord {
            active: false,
            ..store(2, "")
        }])
        .unwrap();

    scrape(&f, 1, 20);
    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert!(group.candidates.is_empty());
    assert_eq!(group.status, GroupStatus::Active);
    assert_eq!(group.members, vec![1, 2, 3, 4]);
}

#[test]
fn monitor_stamps_changes_with_the_scrape_clock() {
    let f = fixture();
    let at = 1_600_000_000;
    assert!(matches!(
        scrape(&f, 2, at),
        MonitorOutcome::DivergenceFlagged { .. }
    ));

    let group = f.registry.get_group(&f.group).unwrap().unwrap();
    assert_eq!(group.updated_at, at);
    assert_eq!(group.candidates.len(), 1);
    assert_eq!(group.candidates[0].enqueued_at, at);
}
