//! Geohash histogram that coarsens until one bin is confident enough.

use std::collections::HashMap;

use ::geohash::Coord;
use tracing::{debug, warn};

use crate::types::{EstimateMethod, LocationEstimate, UserId};
use crate::utils::warn_once;

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| BASE32.contains(&b))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeohashAggregator {
    pub precision: usize,
    pub confidence_threshold: f64,
}

/// Top bin after coarsening.
#[derive(Debug, Clone, PartialEq)]
pub struct Coarsened {
    pub key: String,
    pub count: usize,
    pub total: usize,
    /// Truncation steps taken.
    pub steps: usize,
}

impl Coarsened {
    pub fn confidence(&self) -> f64 {
        self.count as f64 / self.total as f64
    }
}

impl GeohashAggregator {
    pub fn new(precision: usize, confidence_threshold: f64) -> Self {
        Self {
            precision: precision.clamp(1, 12),
            confidence_threshold,
        }
    }

    /// Histogram of `(latitude, longitude)` points at full precision.
    pub fn bins(&self, points: &[(f64, f64)]) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for &(lat, lon) in points {
            match ::geohash::encode(Coord { x: lon, y: lat }, self.precision) {
                Ok(key) => *counts.entry(key).or_default() += 1,
                Err(e) => warn_once(format!("cannot geohash {lat} {lon}: {e}")),
            }
        }
        counts.into_iter().collect()
    }

    /// Merge bins by dropping trailing characters until the top bin holds at
    /// least `confidence_threshold` of the samples or keys are one character.
    ///
    /// Takes at most `precision - 1` steps for full-precision input. Empty or
    /// invalid keys are skipped. `None` when no samples remain.
    pub fn coarsen(&self, bins: Vec<(String, usize)>) -> Option<Coarsened> {
        self.coarsen_over(bins, 0)
    }

    /// `coarsen` with shares taken over at least `samples` points, so points
    /// that could not be binned still count against confidence.
    fn coarsen_over(&self, bins: Vec<(String, usize)>, samples: usize) -> Option<Coarsened> {
        let mut bins: Vec<(String, usize)> = bins
            .into_iter()
            .filter(|(key, count)| {
                if !valid_key(key) {
                    warn!("skipping invalid geohash bin {key:?} ({count} samples)");
                    return false;
                }
                *count > 0
            })
            .collect();
        let binned: usize = bins.iter().map(|(_, c)| c).sum();
        if binned == 0 {
            return None;
        }
        let total = binned.max(samples);

        let mut length = bins.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let mut steps = 0;
        rank(&mut bins);
        while (bins[0].1 as f64 / total as f64) < self.confidence_threshold && length > 1 {
            length -= 1;
            let mut merged: HashMap<String, usize> = HashMap::with_capacity(bins.len());
            for (mut key, count) in bins {
                key.truncate(length);
                *merged.entry(key).or_default() += count;
            }
            bins = merged.into_iter().collect();
            rank(&mut bins);
            steps += 1;
        }

        let (key, count) = bins.swap_remove(0);
        Some(Coarsened {
            key,
            count,
            total,
            steps,
        })
    }

    pub fn estimate(&self, user_id: UserId, points: &[(f64, f64)]) -> Option<LocationEstimate> {
        let top = self.coarsen_over(self.bins(points), points.len())?;
        self.estimate_top(user_id, top)
    }

    /// Estimate from precomputed `(geohash, count)` bins.
    pub fn estimate_from_bins(
        &self,
        user_id: UserId,
        bins: Vec<(String, usize)>,
    ) -> Option<LocationEstimate> {
        let top = self.coarsen(bins)?;
        self.estimate_top(user_id, top)
    }

    fn estimate_top(&self, user_id: UserId, top: Coarsened) -> Option<LocationEstimate> {
        debug!(
            "user {user_id}: geohash {} after {} steps ({}/{})",
            top.key, top.steps, top.count, top.total
        );
        let (center, _, _) = match ::geohash::decode(&top.key) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("cannot decode geohash {:?}: {e}", top.key);
                return None;
            }
        };
        let confidence = top.confidence();
        Some(LocationEstimate {
            user_id,
            latitude: center.y,
            longitude: center.x,
            confidence,
            total_samples: top.total,
            method: EstimateMethod::Geohash,
            share_vs_runner_up: None,
            low_confidence: confidence < self.confidence_threshold,
            geohash: Some(top.key),
        })
    }
}

/// Count descending, then key ascending.
fn rank(bins: &mut [(String, usize)]) {
    bins.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}
