//! Density-based clustering of a user's visits.

use std::collections::VecDeque;

use crate::types::{Cluster, EstimateMethod, LocationEstimate, UserId};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisitClusterer {
    pub radius_km: f64,
    /// Neighbors within `radius_km`, the point itself included, needed to join a cluster.
    pub min_points: usize,
}

impl VisitClusterer {
    pub fn new(radius_km: f64, min_points: usize) -> Self {
        Self {
            radius_km,
            min_points: min_points.max(1),
        }
    }

    /// Clusters of `(latitude, longitude)` points, largest first.
    ///
    /// Only points with at least `min_points` neighbors are clustered; two such
    /// points share a cluster when they are connected through neighbors.
    /// Everything else is noise.
    pub fn clusters(&self, points: &[(f64, f64)]) -> Vec<Cluster> {
        let total = points.len();
        if total == 0 {
            return Vec::new();
        }

        let neighbors = self.neighbor_lists(points);
        let core: Vec<bool> = neighbors
            .iter()
            .map(|n| n.len() >= self.min_points)
            .collect();

        let mut assigned = vec![false; total];
        let mut members: Vec<Vec<usize>> = Vec::new();
        for start in 0..total {
            if !core[start] || assigned[start] {
                continue;
            }
            assigned[start] = true;
            let mut cluster = Vec::new();
            let mut queue = VecDeque::from([start]);
            while let Some(i) = queue.pop_front() {
                cluster.push(i);
                for &j in &neighbors[i] {
                    if core[j] && !assigned[j] {
                        assigned[j] = true;
                        queue.push_back(j);
                    }
                }
            }
            members.push(cluster);
        }

        let mut clusters: Vec<Cluster> = members
            .iter()
            .map(|cluster| {
                let n = cluster.len() as f64;
                let (lat_sum, lon_sum) = cluster
                    .iter()
                    .fold((0.0, 0.0), |(la, lo), &i| (la + points[i].0, lo + points[i].1));
                Cluster {
                    centroid_lat: lat_sum / n,
                    centroid_lon: lon_sum / n,
                    member_count: cluster.len(),
                    share_of_total: n / total as f64,
                    share_vs_runner_up: None,
                }
            })
            .collect();
        clusters.sort_by(|a, b| b.member_count.cmp(&a.member_count));

        if clusters.len() >= 2 {
            let runner_up = clusters[1].member_count as f64;
            let top = &mut clusters[0];
            top.share_vs_runner_up = Some(runner_up / top.member_count as f64);
        }
        clusters
    }

    /// Estimate from the largest cluster. `None` when no cluster forms.
    pub fn estimate(&self, user_id: UserId, points: &[(f64, f64)]) -> Option<LocationEstimate> {
        let top = self.clusters(points).into_iter().next()?;
        Some(LocationEstimate {
            user_id,
            latitude: top.centroid_lat,
            longitude: top.centroid_lon,
            confidence: top.share_of_total,
            total_samples: points.len(),
            method: EstimateMethod::Cluster,
            share_vs_runner_up: top.share_vs_runner_up,
            geohash: None,
            low_confidence: false,
        })
    }

    /// Indices within `radius_km` of each point, itself included.
    fn neighbor_lists(&self, points: &[(f64, f64)]) -> Vec<Vec<usize>> {
        // Candidates come from a latitude band; no point outside it can be in range.
        let band = (self.radius_km / EARTH_RADIUS_KM).to_degrees();
        let mut by_lat: Vec<usize> = (0..points.len()).collect();
        by_lat.sort_by(|&a, &b| points[a].0.total_cmp(&points[b].0));

        let mut lists = vec![Vec::new(); points.len()];
        for (rank, &i) in by_lat.iter().enumerate() {
            let (lat, lon) = points[i];
            let first = by_lat[..rank].partition_point(|&j| points[j].0 < lat - band);
            for &j in &by_lat[first..] {
                if points[j].0 > lat + band {
                    break;
                }
                if haversine_km(lat, lon, points[j].0, points[j].1) <= self.radius_km {
                    lists[i].push(j);
                }
            }
            lists[i].sort_unstable();
        }
        lists
    }
}
