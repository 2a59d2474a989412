//! Physical retail store records and their scrape state.
//!
//! Store attributes (chain, division, coordinates, active flag) are owned by the
//! ingestion feed. The scheduler only touches `last_scraped`, `needs_rescraping`
//! and the lease columns.

use serde::{Deserialize, Serialize};

/// Column list matching [`Store::from_row`].
pub const STORE_COLUMNS: &str = "id, chain, division, latitude, longitude, active, \
     last_scraped, needs_rescraping, scheduled_at, lease_token";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: i64,
    pub chain: String,
    pub division: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub active: bool,
    /// Epoch seconds of the last successful scrape; `None` = never scraped.
    pub last_scraped: Option<i64>,
    pub needs_rescraping: bool,
    /// Epoch seconds at which the current lease was taken.
    pub scheduled_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
}

/// Per-store scheduling state.
///
/// `NeverScraped -> Scraped -> (Stale | Flagged) -> Scraped -> ...`; there is no
/// terminal state during normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScrapeState {
    NeverScraped,
    Scraped,
    Stale,
    Flagged,
}

impl ScrapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeState::NeverScraped => "NEVER_SCRAPED",
            ScrapeState::Scraped => "SCRAPED",
            ScrapeState::Stale => "STALE",
            ScrapeState::Flagged => "FLAGGED",
        }
    }
}

impl Store {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Store> {
        Ok(Store {
            id: row.get(0)?,
            chain: row.get(1)?,
            division: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            active: row.get::<_, i64>(5)? != 0,
            last_scraped: row.get(6)?,
            needs_rescraping: row.get::<_, i64>(7)? != 0,
            scheduled_at: row.get(8)?,
            lease_token: row.get(9)?,
        })
    }

    /// Coordinates usable for great-circle distance, if both are present and sane.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon))
                if lat.is_finite()
                    && lon.is_finite()
                    && (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lon) =>
            {
                Some((lat, lon))
            }
            _ => None,
        }
    }

    pub fn scrape_state(&self, now: i64, stale_after_secs: i64) -> ScrapeState {
        if self.needs_rescraping {
            return ScrapeState::Flagged;
        }
        match self.last_scraped {
            None => ScrapeState::NeverScraped,
            Some(ts) if now - ts > stale_after_secs => ScrapeState::Stale,
            Some(_) => ScrapeState::Scraped,
        }
    }

    /// Whether a lease is held at `now` under the given TTL.
    pub fn is_leased(&self, now: i64, lease_ttl_secs: i64) -> bool {
        self.scheduled_at
            .is_some_and(|at| at + lease_ttl_secs > now)
    }

    pub fn lease_expires_at(&self, lease_ttl_secs: i64) -> Option<i64> {
        self.scheduled_at.map(|at| at + lease_ttl_secs)
    }
}
