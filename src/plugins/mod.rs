//! Subsystems built on the core registry.
//!
//! - `registry`: groups, memberships, representatives and candidates
//! - `geo`: DBSCAN clustering by great-circle distance
//! - `correlation`: price-identity grouping with union-find
//! - `scheduler`: adaptive lease-based scrape scheduling
//! - `divergence`: closed-loop representative validation
//! - `ingest`: JSON Lines feed loaders

pub mod correlation;
pub mod divergence;
pub mod geo;
pub mod ingest;
pub mod registry;
pub mod scheduler;
