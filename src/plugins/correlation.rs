//! Price-identity grouping of a chain's stores.
//!
//! Two stores are linked when the share of their common products carrying a
//! bit-for-bit identical latest price reaches the threshold (inclusive). Linked
//! stores are merged with union-find; every connected component of size > 1 is a
//! group. This is an O(n²·m) offline pass.

use crate::core::config::CorrelationConfig;
use crate::core::error::ShelfwiseError;
use crate::plugins::registry::{GroupMethod, PriceSet, RebuildSummary, Registry};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stores' prices over an interned product arena.
///
/// Row `i` belongs to `store_ids[i]` and holds `(product, price bits)` sorted by
/// product index, so a pair comparison is a linear merge.
#[derive(Debug, Clone, Default)]
pub struct PriceMatrix {
    pub store_ids: Vec<i64>,
    rows: Vec<Vec<(u32, u64)>>,
    products: usize,
}

impl PriceMatrix {
    pub fn from_price_sets(sets: &BTreeMap<i64, PriceSet>) -> PriceMatrix {
        let mut interned: FxHashMap<&str, u32> = FxHashMap::default();
        let mut matrix = PriceMatrix::default();
        for (&store_id, prices) in sets {
            let mut row: Vec<(u32, u64)> = prices
                .iter()
                .map(|(product, price)| {
                    let next = interned.len() as u32;
                    let idx = *interned.entry(product.as_str()).or_insert(next);
                    (idx, price.to_bits())
                })
                .collect();
            row.sort_unstable_by_key(|&(p, _)| p);
            matrix.store_ids.push(store_id);
            matrix.rows.push(row);
        }
        matrix.products = interned.len();
        matrix
    }

    pub fn len(&self) -> usize {
        self.store_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store_ids.is_empty()
    }

    pub fn product_count(&self) -> usize {
        self.products
    }

    pub fn compare(&self, a: usize, b: usize) -> PairStats {
        compare_rows(&self.rows[a], &self.rows[b])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStats {
    pub common: usize,
    pub identical: usize,
}

impl PairStats {
    pub fn correlation(&self) -> Option<f64> {
        (self.common > 0).then(|| self.identical as f64 / self.common as f64)
    }

    /// Inclusive threshold check in integer basis points.
    pub fn meets(&self, threshold_bps: u64) -> bool {
        self.common > 0 && (self.identical as u64) * 10_000 >= (self.common as u64) * threshold_bps
    }
}

fn compare_rows(a: &[(u32, u64)], b: &[(u32, u64)]) -> PairStats {
    let mut stats = PairStats::default();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                stats.common += 1;
                if a[i].1 == b[j].1 {
                    stats.identical += 1;
                }
                i += 1;
                j += 1;
            }
        }
    }
    stats
}

/// Disjoint-set forest over dense indices.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> UnionFind {
        UnionFind {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Returns false when `a` and `b` were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    /// Components as index lists, each ascending, ordered by smallest index.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let r = self.find(i);
            by_root.entry(r).or_default().push(i);
        }
        let mut out: Vec<Vec<usize>> = by_root.into_values().collect();
        out.sort_by_key(|c| c[0]);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub stores_considered: usize,
    pub edges: usize,
    /// Member ids per component of size > 1, each ascending.
    pub components: Vec<Vec<i64>>,
    /// Considered stores without any qualifying edge.
    pub islands: Vec<i64>,
}

impl CorrelationReport {
    pub fn groups(&self, island_groups: bool) -> Vec<Vec<i64>> {
        let mut groups = self.components.clone();
        if island_groups {
            groups.extend(self.islands.iter().map(|&id| vec![id]));
        }
        groups
    }
}

/// All qualifying edges `(i, j)` with `i < j`, sorted.
pub fn edges(matrix: &PriceMatrix, threshold_bps: u64) -> Vec<(usize, usize)> {
    let n = matrix.len();
    let mut edges: Vec<(usize, usize)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            ((i + 1)..n)
                .filter(move |&j| matrix.compare(i, j).meets(threshold_bps))
                .map(move |j| (i, j))
        })
        .collect();
    edges.sort_unstable();
    edges
}

pub fn correlate(sets: &BTreeMap<i64, PriceSet>, config: &CorrelationConfig) -> CorrelationReport {
    let considered: BTreeMap<i64, PriceSet> = sets
        .iter()
        .filter(|(_, p)| p.len() >= config.min_products)
        .map(|(id, p)| (*id, p.clone()))
        .collect();
    let matrix = PriceMatrix::from_price_sets(&considered);
    let edges = edges(&matrix, config.threshold_bps());

    let mut uf = UnionFind::new(matrix.len());
    for &(a, b) in &edges {
        uf.union(a, b);
    }

    let mut report = CorrelationReport {
        stores_considered: matrix.len(),
        edges: edges.len(),
        ..CorrelationReport::default()
    };
    for component in uf.components() {
        if component.len() > 1 {
            report
                .components
                .push(component.iter().map(|&i| matrix.store_ids[i]).collect());
        } else {
            report.islands.push(matrix.store_ids[component[0]]);
        }
    }
    report
}

/// Dry run: compute the grouping without touching the registry.
pub fn plan_chain(
    registry: &Registry,
    chain: &str,
    config: &CorrelationConfig,
) -> Result<CorrelationReport, ShelfwiseError> {
    let sets = registry.chain_prices(chain, config.min_products)?;
    let report = correlate(&sets, config);
    tracing::info!(
        chain,
        considered = report.stores_considered,
        edges = report.edges,
        components = report.components.len(),
        islands = report.islands.len(),
        "correlation computed"
    );
    Ok(report)
}

pub fn rebuild_chain(
    registry: &Registry,
    chain: &str,
    config: &CorrelationConfig,
) -> Result<(CorrelationReport, RebuildSummary), ShelfwiseError> {
    let report = plan_chain(registry, chain, config)?;
    let summary = registry.rebuild_chain(
        chain,
        GroupMethod::Correlation,
        &report.groups(config.island_groups),
    )?;
    Ok((report, summary))
}
