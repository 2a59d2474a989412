//! Tunables loaded from `<root>/shelfwise.toml`.
//!
//! Every table is optional; a missing file means defaults. Values are validated once
//! at load time so the passes can trust them.

use crate::core::error::ShelfwiseError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub geo: GeoConfig,
    pub correlation: CorrelationConfig,
    pub divergence: DivergenceConfig,
    /// Per-chain overrides keyed by chain identifier.
    pub chains: BTreeMap<String, ChainConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lease_ttl_secs: i64,
    /// Probability of picking the largest active group.
    pub exploit_weight: f64,
    /// Probability of picking a uniformly random other group.
    pub explore_groups_weight: f64,
    /// Probability of scraping an ungrouped store instead.
    pub explore_outliers_weight: f64,
    pub representative_refresh_secs: i64,
    pub stale_after_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 4 * 60 * 60,
            exploit_weight: 0.80,
            explore_groups_weight: 0.15,
            explore_outliers_weight: 0.05,
            representative_refresh_secs: 24 * 60 * 60,
            stale_after_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub radius_km: f64,
    pub min_points: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            radius_km: 25.0,
            min_points: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Stores with fewer distinct priced products are left out of the pass.
    pub min_products: usize,
    /// Fraction of identical common prices required for an edge (inclusive).
    pub threshold: f64,
    /// Whether stores without any edge head their own one-store group.
    pub island_groups: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            min_products: 100,
            threshold: 0.995,
            island_groups: false,
        }
    }
}

impl CorrelationConfig {
    /// Threshold in basis points, so edge checks stay in integer arithmetic.
    pub fn threshold_bps(&self) -> u64 {
        (self.threshold * 10_000.0).round() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceConfig {
    /// Maximum tolerated fraction of differing common prices.
    pub tolerance: f64,
    pub sample_size: usize,
    pub max_candidates: usize,
    pub max_attempts: u32,
    pub min_common_products: usize,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.005,
            sample_size: 3,
            max_candidates: 2,
            max_attempts: 3,
            min_common_products: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChainConfig {
    /// Division/banner tags that must never stand in for the main banner.
    pub non_representative_divisions: Vec<String>,
}

impl Config {
    /// Load `<root>/shelfwise.toml`; no file means defaults.
    pub fn load(root: &Path) -> Result<Config, ShelfwiseError> {
        let path = root.join(schemas::CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path).map_err(ShelfwiseError::IoError)?;
        Config::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config, ShelfwiseError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ShelfwiseError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn non_representative_divisions(&self, chain: &str) -> &[String] {
        self.chains
            .get(chain)
            .map(|c| c.non_representative_divisions.as_slice())
            .unwrap_or(&[])
    }

    pub fn validate(&self) -> Result<(), ShelfwiseError> {
        let s = &self.scheduler;
        if s.lease_ttl_secs <= 0 {
            return Err(invalid("scheduler.lease_ttl_secs must be > 0"));
        }
        let weights = [
            s.exploit_weight,
            s.explore_groups_weight,
            s.explore_outliers_weight,
        ];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(invalid("scheduler weights must each lie in [0, 1]"));
        }
        if (weights.iter().sum::<f64>() - 1.0).abs() > 1e-9 {
            return Err(invalid("scheduler weights must sum to 1"));
        }
        if s.representative_refresh_secs < 0 || s.stale_after_secs < 0 {
            return Err(invalid("scheduler intervals must not be negative"));
        }
        if !(self.geo.radius_km.is_finite() && self.geo.radius_km > 0.0) {
            return Err(invalid("geo.radius_km must be a positive number"));
        }
        if self.geo.min_points < 2 {
            return Err(invalid("geo.min_points must be >= 2"));
        }
        if !(0.0..=1.0).contains(&self.correlation.threshold) || self.correlation.threshold == 0.0
        {
            return Err(invalid("correlation.threshold must lie in (0, 1]"));
        }
        let d = &self.divergence;
        if !(0.0..1.0).contains(&d.tolerance) {
            return Err(invalid("divergence.tolerance must lie in [0, 1)"));
        }
        if d.sample_size == 0 || d.max_candidates == 0 || d.max_attempts == 0 {
            return Err(invalid(
                "divergence.sample_size, max_candidates and max_attempts must be >= 1",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ShelfwiseError {
    ShelfwiseError::ConfigError(msg.to_string())
}
