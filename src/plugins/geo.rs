//! Geographic clustering of a chain's stores.
//!
//! DBSCAN over great-circle distance. Points are indices into a slice sorted by
//! store id, so the same input always produces the same labels. A neighborhood
//! counts the point itself; a point with fewer than `min_points` neighbors inside
//! `radius_km` is not a core point.

use crate::core::config::GeoConfig;
use crate::core::error::ShelfwiseError;
use crate::plugins::registry::{GroupMethod, RebuildSummary, Registry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Mean earth radius (IUGG), kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub store_id: i64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoLabel {
    Cluster(usize),
    Noise,
}

/// Great-circle distance in kilometres between two (lat, lon) pairs in degrees.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn validate_params(params: &GeoConfig) -> Result<(), ShelfwiseError> {
    if !(params.radius_km.is_finite() && params.radius_km > 0.0) {
        return Err(ShelfwiseError::ValidationError(format!(
            "radius_km must be a positive number, got {}",
            params.radius_km
        )));
    }
    if params.min_points < 2 {
        return Err(ShelfwiseError::ValidationError(format!(
            "min_points must be >= 2, got {}",
            params.min_points
        )));
    }
    Ok(())
}

/// Label every point. Cluster numbers follow discovery order.
pub fn dbscan(points: &[GeoPoint], params: &GeoConfig) -> Vec<GeoLabel> {
    let neighbors: Vec<Vec<usize>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let p = (points[i].lat, points[i].lon);
            points
                .iter()
                .enumerate()
                .filter(|(_, q)| haversine_km(p, (q.lat, q.lon)) <= params.radius_km)
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut labels: Vec<Option<GeoLabel>> = vec![None; points.len()];
    let mut next_cluster = 0usize;

    for i in 0..points.len() {
        if labels[i].is_some() {
            continue;
        }
        if neighbors[i].len() < params.min_points {
            labels[i] = Some(GeoLabel::Noise);
            continue;
        }
        let cluster = GeoLabel::Cluster(next_cluster);
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queue: VecDeque<usize> = neighbors[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                // border point previously marked as noise
                Some(GeoLabel::Noise) => labels[j] = Some(cluster),
                Some(GeoLabel::Cluster(_)) => {}
                None => {
                    labels[j] = Some(cluster);
                    if neighbors[j].len() >= params.min_points {
                        queue.extend(neighbors[j].iter().copied());
                    }
                }
            }
        }
    }

    labels
        .into_iter()
        .map(|l| l.unwrap_or(GeoLabel::Noise))
        .collect()
}

/// Proposed grouping for one chain, before it is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoPlan {
    /// Member ids per cluster, each ascending.
    pub clusters: Vec<Vec<i64>>,
    /// Noise stores; each becomes its own one-store group.
    pub islands: Vec<i64>,
    /// Stores left out: inactive or without usable coordinates.
    pub skipped: Vec<i64>,
}

impl GeoPlan {
    pub fn groups(&self) -> Vec<Vec<i64>> {
        self.clusters
            .iter()
            .cloned()
            .chain(self.islands.iter().map(|&id| vec![id]))
            .collect()
    }
}

pub fn plan_chain(
    registry: &Registry,
    chain: &str,
    params: &GeoConfig,
) -> Result<GeoPlan, ShelfwiseError> {
    validate_params(params)?;
    let mut plan = GeoPlan::default();
    let mut points = Vec::new();
    for store in registry.list_stores(chain)? {
        match store.coordinates() {
            Some((lat, lon)) if store.active => points.push(GeoPoint {
                store_id: store.id,
                lat,
                lon,
            }),
            _ => plan.skipped.push(store.id),
        }
    }

    let labels = dbscan(&points, params);
    for (point, label) in points.iter().zip(labels) {
        match label {
            GeoLabel::Cluster(c) => {
                if plan.clusters.len() <= c {
                    plan.clusters.resize_with(c + 1, Vec::new);
                }
                plan.clusters[c].push(point.store_id);
            }
            GeoLabel::Noise => plan.islands.push(point.store_id),
        }
    }
    Ok(plan)
}

/// Replace the chain's grouping with a fresh geographic clustering.
pub fn rebuild_chain(
    registry: &Registry,
    chain: &str,
    params: &GeoConfig,
) -> Result<(GeoPlan, RebuildSummary), ShelfwiseError> {
    let plan = plan_chain(registry, chain, params)?;
    tracing::info!(
        chain,
        clusters = plan.clusters.len(),
        islands = plan.islands.len(),
        skipped = plan.skipped.len(),
        "geo clustering planned"
    );
    let summary = registry.rebuild_chain(chain, GroupMethod::Geo, &plan.groups())?;
    Ok((plan, summary))
}
