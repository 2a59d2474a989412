use shelfwise::core::config::{CorrelationConfig, GeoConfig};
use shelfwise::plugins::correlation::{self, PriceMatrix};
use shelfwise::plugins::geo;
use shelfwise::plugins::registry::{GroupMethod, PriceObservation, PriceSet, Registry, StoreRecord};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn priced(n: usize, identical: usize) -> (PriceSet, PriceSet) {
    let a: PriceSet = (0..n).map(|i| (format!("sku-{i:05}"), 1.0 + i as f64 * 0.01)).collect();
    let b: PriceSet = a
        .iter()
        .enumerate()
        .map(|(i, (k, v))| (k.clone(), if i < identical { *v } else { *v + 0.5 }))
        .collect();
    (a, b)
}

fn pair(n: usize, identical: usize) -> BTreeMap<i64, PriceSet> {
    let (a, b) = priced(n, identical);
    BTreeMap::from([(1, a), (2, b)])
}

#[test]
fn threshold_is_inclusive_at_exactly_ninety_nine_point_five() {
    let config = CorrelationConfig::default();
    let report = correlation::correlate(&pair(200, 199), &config);
    assert_eq!(report.edges, 1);
    assert_eq!(report.components, vec![vec![1, 2]]);

    let matrix = PriceMatrix::from_price_sets(&pair(200, 199));
    let stats = matrix.compare(0, 1);
    assert_eq!(stats.common, 200);
    assert_eq!(stats.identical, 199);
    assert!(stats.meets(config.threshold_bps()));
}

#[test]
fn just_below_threshold_creates_no_edge() {
    let config = CorrelationConfig::default();
    let report = correlation::correlate(&pair(500, 497), &config);
    assert_eq!(report.edges, 0);
    assert!(report.components.is_empty());
    assert_eq!(report.islands, vec![1, 2]);
}

#[test]
fn only_common_products_count() {
    let config = CorrelationConfig {
        min_products: 10,
        ..CorrelationConfig::default()
    };
    let (a, mut b) = priced(20, 20);
    // Extra products on one side do not dilute the correlation.
    for i in 0..50 {
        b.insert(format!("extra-{i}"), 3.0);
    }
    let report = correlation::correlate(&BTreeMap::from([(1, a), (2, b)]), &config);
    assert_eq!(report.components, vec![vec![1, 2]]);
}

fn geo_store(id: i64, lat: f64, lon: f64) -> StoreRecord {
    StoreRecord {
        id,
        chain: "acme".to_string(),
        division: String::new(),
        latitude: Some(lat),
        longitude: Some(lon),
        active: true,
    }
}

fn partition(registry: &Registry) -> Vec<Vec<i64>> {
    let mut members: Vec<Vec<i64>> = registry
        .list_groups("acme")
        .unwrap()
        .into_iter()
        .map(|g| g.members)
        .collect();
    members.sort();
    members
}

#[test]
fn geo_rebuild_is_idempotent() {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    let mut stores = vec![
        geo_store(1, 45.50, -73.56),
        geo_store(2, 45.52, -73.60),
        geo_store(3, 45.48, -73.50),
        geo_store(4, 43.65, -79.38),
        geo_store(5, 43.66, -79.39),
        geo_store(6, 43.67, -79.40),
        geo_store(7, 49.28, -123.12),
    ];
    stores.push(StoreRecord {
        latitude: None,
        ..geo_store(8, 0.0, 0.0)
    });
    registry.upsert_stores(&stores).unwrap();
    let params = GeoConfig::default();

    let (plan, summary) = geo::rebuild_chain(&registry, "acme", &params).unwrap();
    assert_eq!(plan.clusters, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    assert_eq!(plan.islands, vec![7]);
    assert_eq!(plan.skipped, vec![8]);
    assert_eq!(summary.groups_created, 3);
    let first = partition(&registry);

    let (_, summary) = geo::rebuild_chain(&registry, "acme", &params).unwrap();
    assert_eq!(summary.groups_removed, 3);
    assert_eq!(partition(&registry), first);
    assert!(
        registry
            .list_groups("acme")
            .unwrap()
            .iter()
            .all(|g| g.method == GroupMethod::Geo)
    );
}

#[test]
fn correlation_rebuild_groups_identically_priced_stores() {
    let tmp = tempdir().unwrap();
    let registry = Registry::open(tmp.path()).unwrap();
    registry
        .upsert_stores(&(1..=4).map(|id| geo_store(id, 0.0, 0.0)).collect::<Vec<_>>())
        .unwrap();

    let mut obs = Vec::new();
    for store_id in 1..=4 {
        for p in 0..150 {
            let bump = if store_id == 4 { 0.25 } else { 0.0 };
            obs.push(PriceObservation {
                store_id,
                product_id: format!("sku-{p}"),
                price: 2.0 + p as f64 * 0.1 + bump,
                observed_at: 10,
            });
        }
    }
    registry.record_prices(&obs).unwrap();

    let config = CorrelationConfig::default();
    let (report, summary) = correlation::rebuild_chain(&registry, "acme", &config).unwrap();
    assert_eq!(report.stores_considered, 4);
    assert_eq!(report.components, vec![vec![1, 2, 3]]);
    assert_eq!(report.islands, vec![4]);
    assert_eq!(summary.groups_created, 1);
    assert_eq!(partition(&registry), vec![vec![1, 2, 3]]);
    assert_eq!(registry.group_of(4).unwrap(), None);

    let with_islands = CorrelationConfig {
        island_groups: true,
        ..config
    };
    correlation::rebuild_chain(&registry, "acme", &with_islands).unwrap();
    assert_eq!(partition(&registry), vec![vec![1, 2, 3], vec![4]]);
}
