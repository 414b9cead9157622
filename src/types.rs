use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ActivityId = i64;

/// One unique activity from a user's export, geotagged or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub activity_id: ActivityId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub language: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ActivityItem {
    /// `(latitude, longitude)` when the item carried a coordinate pair.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Point-in-time user metadata. Only changes are retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub activity_id: ActivityId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub language: String,
    pub utc_offset: Option<i32>,
    pub time_zone: String,
}

impl ProfileSnapshot {
    /// Value equality on the tracked metadata, ignoring which activity produced it.
    pub fn same_profile(&self, other: &ProfileSnapshot) -> bool {
        self.time_zone == other.time_zone
            && self.utc_offset == other.utc_offset
            && self.language == other.language
    }
}

/// A geotagged activity with local-time buckets derived from its resolved time zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedActivity {
    pub activity_id: ActivityId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub month: u32,       // Jan = 1, ..., Dec = 12
    pub weekday: u32,     // Sun = 0, Mon = 1, ..., Sat = 6
    pub hour_of_day: u32, // 0..=23
    pub time_zone: String, // IANA name, empty when unresolved
}

/// One user's parsed export.
///
/// `timeline` is sorted by `created_at`, `profiles` never holds two adjacent
/// snapshots with the same profile, and every item belongs to `id`.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub id: UserId,
    pub timeline: Vec<ActivityItem>,
    pub geotagged: Vec<NormalizedActivity>,
    pub profiles: Vec<ProfileSnapshot>,
}

/// Per-group parse counters, summed into run-wide totals by the aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Successfully parsed records, duplicates included.
    pub records: u64,
    /// Records kept after deduplication.
    pub unique: u64,
    pub duplicates: u64,
    pub geotagged: u64,
    /// Lines dropped because the record or its timestamp did not parse.
    pub malformed: u64,
}

impl AddAssign<&Summary> for Summary {
    fn add_assign(&mut self, other: &Summary) {
        self.records += other.records;
        self.unique += other.unique;
        self.duplicates += other.duplicates;
        self.geotagged += other.geotagged;
        self.malformed += other.malformed;
    }
}

/// A ranked group of points produced by the visit clusterer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub member_count: usize,
    pub share_of_total: f64,
    /// `runner_up_count / member_count`, set on the top cluster when two or more exist.
    pub share_vs_runner_up: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    Cluster,
    Geohash,
}

impl EstimateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateMethod::Cluster => "cluster",
            EstimateMethod::Geohash => "geohash",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cluster" => Some(EstimateMethod::Cluster),
            "geohash" => Some(EstimateMethod::Geohash),
            _ => None,
        }
    }
}

impl fmt::Display for EstimateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final home/visit location for one user, whichever method produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEstimate {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    /// Share of the user's samples attributed to the chosen location, 0..=1.
    pub confidence: f64,
    pub total_samples: usize,
    pub method: EstimateMethod,
    pub share_vs_runner_up: Option<f64>,
    /// Final bin key for geohash estimates.
    pub geohash: Option<String>,
    /// Geohash estimates that exhausted truncation below the threshold.
    pub low_confidence: bool,
}

/// A named location calculation and the parameters it ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationCalc {
    pub name: String,
    pub method: String,
    pub cluster_radius_km: f64,
    pub min_points: usize,
    pub geohash_precision: usize,
    pub confidence_threshold: f64,
    pub activity_filter: String,
}
