//! Per-user home location inference over stored activity.

pub mod geohash;
pub mod visits;

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::repository::Repository;
use crate::types::{EstimateMethod, LocationCalc, LocationEstimate, NormalizedActivity, UserId};

pub use self::geohash::GeohashAggregator;
pub use self::visits::VisitClusterer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocateMethod {
    Cluster,
    Geohash,
    /// Cluster first, geohash when no cluster forms.
    Auto,
}

impl LocateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocateMethod::Cluster => "cluster",
            LocateMethod::Geohash => "geohash",
            LocateMethod::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cluster" => Some(LocateMethod::Cluster),
            "geohash" => Some(LocateMethod::Geohash),
            "auto" => Some(LocateMethod::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for LocateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LocateOptions {
    pub method: LocateMethod,
    pub clusterer: VisitClusterer,
    pub aggregator: GeohashAggregator,
    /// Geohash estimates with a shorter final key are discarded.
    pub min_usable_length: usize,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            method: LocateMethod::Cluster,
            clusterer: VisitClusterer::new(0.1, 2),
            aggregator: GeohashAggregator::new(12, 0.1),
            min_usable_length: 1,
        }
    }
}

impl LocateOptions {
    pub fn calc(&self, name: &str, filter: &str) -> LocationCalc {
        LocationCalc {
            name: name.to_string(),
            method: self.method.as_str().to_string(),
            cluster_radius_km: self.clusterer.radius_km,
            min_points: self.clusterer.min_points,
            geohash_precision: self.aggregator.precision,
            confidence_threshold: self.aggregator.confidence_threshold,
            activity_filter: filter.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocateReport {
    pub users: usize,
    pub estimated: usize,
    pub no_estimate: usize,
    pub discarded: usize,
    pub by_method: BTreeMap<EstimateMethod, usize>,
}

enum UserOutcome {
    Estimated(LocationEstimate),
    NoEstimate,
    Discarded,
}

/// `(latitude, longitude)` points per user, users in ascending id order.
pub fn points_by_user(activities: &[NormalizedActivity]) -> Vec<(UserId, Vec<(f64, f64)>)> {
    let mut users: BTreeMap<UserId, Vec<(f64, f64)>> = BTreeMap::new();
    for activity in activities {
        users
            .entry(activity.user_id)
            .or_default()
            .push((activity.latitude, activity.longitude));
    }
    users.into_iter().collect()
}

fn locate_user(options: &LocateOptions, user_id: UserId, points: &[(f64, f64)]) -> UserOutcome {
    let estimate = match options.method {
        LocateMethod::Cluster => options.clusterer.estimate(user_id, points),
        LocateMethod::Geohash => options.aggregator.estimate(user_id, points),
        LocateMethod::Auto => options
            .clusterer
            .estimate(user_id, points)
            .or_else(|| options.aggregator.estimate(user_id, points)),
    };

    match estimate {
        Some(estimate)
            if estimate
                .geohash
                .as_ref()
                .is_some_and(|key| key.len() < options.min_usable_length) =>
        {
            debug!("user {user_id}: geohash estimate too coarse, discarded");
            UserOutcome::Discarded
        }
        Some(estimate) => UserOutcome::Estimated(estimate),
        None => {
            debug!("user {user_id}: no estimate from {} points", points.len());
            UserOutcome::NoEstimate
        }
    }
}

/// Estimate every user's location in parallel.
pub fn locate_all(
    activities: &[NormalizedActivity],
    options: &LocateOptions,
) -> (Vec<LocationEstimate>, LocateReport) {
    let users = points_by_user(activities);
    let outcomes: Vec<UserOutcome> = users
        .par_iter()
        .map(|(user_id, points)| locate_user(options, *user_id, points))
        .collect();

    let mut report = LocateReport {
        users: users.len(),
        ..LocateReport::default()
    };
    let mut estimates = Vec::new();
    for outcome in outcomes {
        match outcome {
            UserOutcome::Estimated(estimate) => {
                report.estimated += 1;
                *report.by_method.entry(estimate.method).or_default() += 1;
                estimates.push(estimate);
            }
            UserOutcome::NoEstimate => report.no_estimate += 1,
            UserOutcome::Discarded => report.discarded += 1,
        }
    }
    (estimates, report)
}

/// Load filtered activity, estimate every user and store the results under `name`.
pub fn run_calc<R: Repository>(
    repository: &mut R,
    name: &str,
    filter: &str,
    options: &LocateOptions,
) -> Result<LocateReport> {
    let activities = repository.list_activities(filter)?;
    info!(
        "locating {} activities with {} (calc {name})",
        activities.len(),
        options.method
    );
    let (estimates, report) = locate_all(&activities, options);

    repository.insert_calc(&options.calc(name, filter))?;
    repository.insert_estimates(name, &estimates)?;
    info!(
        "stored {} estimates for {} users ({} without estimate, {} discarded)",
        report.estimated, report.users, report.no_estimate, report.discarded
    );
    Ok(report)
}
