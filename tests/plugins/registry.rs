use shelfwise::core::error::ShelfwiseError;
use shelfwise::plugins::registry::{
    GroupMethod, GroupStatus, PriceObservation, Registry, StoreRecord,
};
use shelfwise::core::db;
use tempfile::tempdir;

fn store(id: i64, chain: &str) -> StoreRecord {
    StoreRecord {
        id,
        chain: chain.to_string(),
        division: String::new(),
        latitude: None,
        longitude: None,
        active: true,
    }
}

fn seeded(ids: &[i64]) -> (tempfile::TempDir, Registry) {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    let records: Vec<StoreRecord> = ids.iter().map(|&id| store(id, "acme")).collect();
    registry.upsert_stores(&records).unwrap();
    (tmp, registry)
}

#[test]
fn store_belongs_to_at_most_one_group() {
    let (_tmp, registry) = seeded(&[1, 2, 3]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    let err = registry
        .create_group("acme", GroupMethod::Manual, &[2, 3])
        .unwrap_err();
    assert!(matches!(err, ShelfwiseError::Conflict(_)), "{err}");
    assert!(err.is_invariant_violation());

    assert_eq!(registry.group_of(2).unwrap().as_deref(), Some(g.as_str()));
    assert_eq!(registry.group_of(3).unwrap(), None);
}

#[test]
fn failed_create_leaves_nothing_behind() {
    let (_tmp, registry) = seeded(&[1, 2]);
    let err = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2, 99])
        .unwrap_err();
    assert!(matches!(err, ShelfwiseError::NotFound(_)), "{err}");
    assert!(registry.list_groups("acme").unwrap().is_empty());
    assert_eq!(registry.group_of(1).unwrap(), None);
}

#[test]
fn create_rejects_foreign_chain_and_empty_groups() {
    let (_tmp, registry) = seeded(&[1]);
    registry.upsert_stores(&[store(7, "other")]).unwrap();
    let err = registry
        .create_group("acme", GroupMethod::Manual, &[1, 7])
        .unwrap_err();
    assert!(matches!(err, ShelfwiseError::ValidationError(_)), "{err}");
    assert!(
        registry
            .create_group("acme", GroupMethod::Manual, &[])
            .is_err()
    );
}

#[test]
fn representative_must_be_a_member() {
    let (_tmp, registry) = seeded(&[1, 2, 3]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    let err = registry.set_representative(&g, 3).unwrap_err();
    assert!(
        matches!(err, ShelfwiseError::NotAMember { store_id: 3, .. }),
        "{err}"
    );

    registry.set_representative(&g, 2).unwrap();
    let group = registry.get_group(&g).unwrap().unwrap();
    assert_eq!(group.representative, Some(2));
    assert_eq!(group.members, vec![1, 2]);
    assert_eq!(group.method, GroupMethod::Manual);
    assert_eq!(group.status, GroupStatus::Active);
}

#[test]
fn representative_and_candidate_roles_are_exclusive() {
    let (_tmp, registry) = seeded(&[1, 2, 3, 4]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2, 3])
        .unwrap();
    let other = registry
        .create_group("acme", GroupMethod::Manual, &[4])
        .unwrap();
    registry.set_representative(&g, 1).unwrap();

    let err = registry.add_candidate(&g, 1).unwrap_err();
    assert!(
        matches!(err, ShelfwiseError::AlreadyPending { store_id: 1 }),
        "{err}"
    );

    registry.add_candidate(&g, 2).unwrap();
    let err = registry.add_candidate(&g, 2).unwrap_err();
    assert!(matches!(err, ShelfwiseError::AlreadyPending { .. }), "{err}");

    let err = registry.add_candidate(&other, 3).unwrap_err();
    assert!(matches!(err, ShelfwiseError::NotAMember { .. }), "{err}");

    assert_eq!(
        registry.pending_stores("acme").unwrap().into_iter().collect::<Vec<_>>(),
        vec![1, 2]
    );

    // Promoting a candidate drops its candidacy.
    registry.set_representative(&g, 2).unwrap();
    let group = registry.get_group(&g).unwrap().unwrap();
    assert!(group.candidates.is_empty());
    assert_eq!(group.representative, Some(2));
}

#[test]
fn candidate_misses_are_counted() {
    let (_tmp, registry) = seeded(&[1, 2]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    registry.add_candidate(&g, 2).unwrap();
    assert_eq!(registry.record_candidate_miss(&g, 2).unwrap(), 1);
    assert_eq!(registry.record_candidate_miss(&g, 2).unwrap(), 2);
    assert_eq!(
        registry.get_group(&g).unwrap().unwrap().candidate(2).unwrap().attempts,
        2
    );
    assert!(registry.remove_candidate(&g, 2).unwrap());
    assert!(!registry.remove_candidate(&g, 2).unwrap());
    assert!(matches!(
        registry.record_candidate_miss(&g, 2),
        Err(ShelfwiseError::NotFound(_))
    ));
}

#[test]
fn status_transitions_and_retirement() {
    let (_tmp, registry) = seeded(&[1, 2]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    registry.set_representative(&g, 1).unwrap();
    registry.flag_divergence(&g).unwrap();
    registry.flag_divergence(&g).unwrap();
    assert_eq!(
        registry.get_group(&g).unwrap().unwrap().status,
        GroupStatus::DivergenceDetected
    );
    registry.mark_active(&g).unwrap();
    assert_eq!(
        registry.get_group(&g).unwrap().unwrap().status,
        GroupStatus::Active
    );

    registry.retire_group(&g).unwrap();
    let group = registry.get_group(&g).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Retired);
    assert!(!group.active);
    assert!(group.members.is_empty());
    assert_eq!(group.representative, None);
    assert!(registry.mark_active(&g).is_err());
    assert_eq!(registry.group_of(1).unwrap(), None);

    assert!(matches!(
        registry.flag_divergence("missing"),
        Err(ShelfwiseError::NotFound(_))
    ));
}

#[test]
fn rebuild_replaces_chain_groups_and_skips_bad_members() {
    let (_tmp, registry) = seeded(&[1, 2, 3, 4, 5]);
    registry.upsert_stores(&[store(9, "other")]).unwrap();
    let other = registry
        .create_group("other", GroupMethod::Manual, &[9])
        .unwrap();
    let old = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    registry.set_representative(&old, 1).unwrap();
    registry.add_candidate(&old, 2).unwrap();

    let summary = registry
        .rebuild_chain(
            "acme",
            GroupMethod::Geo,
            &[vec![1, 3, 9], vec![3, 4], vec![42]],
        )
        .unwrap();
    assert_eq!(summary.groups_removed, 1);
    assert_eq!(summary.groups_created, 2);
    assert_eq!(summary.members_linked, 3);
    let skipped: Vec<i64> = summary.skipped.iter().map(|s| s.store_id).collect();
    assert_eq!(skipped, vec![9, 3, 42]);

    assert!(registry.get_group(&old).unwrap().is_none());
    let groups = registry.list_groups("acme").unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].members, vec![1, 3]);
    assert_eq!(groups[1].members, vec![4]);
    assert!(groups.iter().all(|g| g.method == GroupMethod::Geo));
    assert!(groups.iter().all(|g| g.representative.is_none()));
    assert!(groups[0].id < groups[1].id);
    assert!(registry.pending_stores("acme").unwrap().is_empty());

    // Other chains are untouched.
    assert_eq!(registry.group_of(9).unwrap().as_deref(), Some(other.as_str()));
}

#[test]
fn chain_change_releases_membership() {
    let (_tmp, registry) = seeded(&[1, 2]);
    let g = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    registry.set_representative(&g, 1).unwrap();
    registry.upsert_stores(&[store(1, "other")]).unwrap();

    assert_eq!(registry.group_of(1).unwrap(), None);
    let group = registry.get_group(&g).unwrap().unwrap();
    assert_eq!(group.members, vec![2]);
    assert_eq!(group.representative, None);
    assert_eq!(registry.get_store(1).unwrap().unwrap().chain, "other");
}

#[test]
fn upsert_keeps_scheduler_columns_and_skips_chainless_records() {
    let (_tmp, registry) = seeded(&[1]);
    registry.set_needs_rescraping(1, true).unwrap();
    let mut rec = store(1, "acme");
    rec.division = "express".into();
    let summary = registry
        .upsert_stores(&[rec, store(2, "  ")])
        .unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.skipped, 1);

    let s = registry.get_store(1).unwrap().unwrap();
    assert_eq!(s.division, "express");
    assert!(s.needs_rescraping);
    assert!(registry.get_store(2).unwrap().is_none());
    assert!(matches!(
        registry.set_needs_rescraping(2, true),
        Err(ShelfwiseError::NotFound(_))
    ));
}

#[test]
fn older_price_observations_never_win() {
    let (_tmp, registry) = seeded(&[1]);
    let obs = |price: f64, at: i64| PriceObservation {
        store_id: 1,
        product_id: "sku-1".into(),
        price,
        observed_at: at,
    };
    let summary = registry
        .record_prices(&[
            obs(2.49, 200),
            obs(1.99, 100),
            obs(f64::NAN, 300),
            PriceObservation {
                store_id: 77,
                ..obs(1.0, 1)
            },
        ])
        .unwrap();
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(registry.latest_prices(1).unwrap()["sku-1"], 2.49);

    registry.record_prices(&[obs(2.29, 250)]).unwrap();
    assert_eq!(registry.latest_prices(1).unwrap()["sku-1"], 2.29);
}

#[test]
fn chain_prices_filters_by_product_count_and_activity() {
    let (_tmp, registry) = seeded(&[1, 2, 3]);
    let mut inactive = store(3, "acme");
    inactive.active = false;
    registry.upsert_stores(&[inactive]).unwrap();

    let mut obs = Vec::new();
    for sid in [1, 2, 3] {
        let n = if sid == 2 { 2 } else { 5 };
        for p in 0..n {
            obs.push(PriceObservation {
                store_id: sid,
                product_id: format!("sku-{p}"),
                price: 1.0,
                observed_at: 1,
            });
        }
    }
    registry.record_prices(&obs).unwrap();
    let sets = registry.chain_prices("acme", 3).unwrap();
    assert_eq!(sets.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(sets[&1].len(), 5);
}

#[test]
fn every_mutation_is_audited() {
    let (tmp, registry) = seeded(&[1]);
    registry
        .create_group("acme", GroupMethod::Manual, &[1])
        .unwrap();
    let log = std::fs::read_to_string(tmp.path().join("registry.events.jsonl")).unwrap();
    let ops: Vec<String> = log
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["op"].as_str().unwrap().to_string()
        })
        .collect();
    assert!(ops.contains(&"registry.upsert_stores".to_string()));
    assert!(ops.contains(&"registry.create_group".to_string()));
}

#[test]
fn failed_rebuild_keeps_previous_grouping() {
    let (_tmp, registry) = seeded(&[1, 2, 3, 4, 5]);
    let old = registry
        .create_group("acme", GroupMethod::Manual, &[1, 2])
        .unwrap();
    registry.set_representative(&old, 1).unwrap();
    registry.add_candidate(&old, 2).unwrap();
    let before = registry.list_groups("acme").unwrap();

    let conn = db::db_connect(&registry.db_path().to_string_lossy()).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER refuse_store_4 BEFORE INSERT ON store_group_members
         WHEN NEW.store_id = 4
         BEGIN SELECT RAISE(ABORT, 'member insert refused'); END;",
    )
    .unwrap();
    drop(conn);

    let err = registry
        .rebuild_chain("acme", GroupMethod::Geo, &[vec![1, 3], vec![4, 5]])
        .unwrap_err();
    assert!(matches!(err, ShelfwiseError::RusqliteError(_)), "{err}");

    assert_eq!(registry.list_groups("acme").unwrap(), before);
    let group = registry.get_group(&old).unwrap().unwrap();
    assert_eq!(group.members, vec![1, 2]);
    assert_eq!(group.representative, Some(1));
    assert_eq!(group.candidates.len(), 1);
    assert_eq!(registry.group_of(3).unwrap(), None);
}
