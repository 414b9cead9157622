//! Local-time bucketing of geotagged activity.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::{ActivityItem, NormalizedActivity};
use crate::utils::warn_once;

/// Maps a coordinate to an IANA zone name. `None` means unresolved.
///
/// Implementations must not panic on out-of-range coordinates.
pub trait TimeZoneResolver: Send + Sync {
    fn resolve(&self, latitude: f64, longitude: f64) -> Option<String>;
}

/// Offline lookup against the `tz-search` boundary tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct TzSearchResolver;

impl TimeZoneResolver for TzSearchResolver {
    fn resolve(&self, latitude: f64, longitude: f64) -> Option<String> {
        if !valid_coordinate(latitude, longitude) {
            return None;
        }
        tz_search::lookup(latitude, longitude).filter(|name| !name.is_empty())
    }
}

pub fn valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Month (1-12), weekday (0 = Sunday) and hour (0-23) of `instant` in `zone`,
/// or in UTC when the zone is unknown.
pub fn local_buckets(instant: DateTime<Utc>, zone: Option<Tz>) -> (u32, u32, u32) {
    match zone {
        Some(tz) => {
            let local = instant.with_timezone(&tz);
            (local.month(), local.weekday().num_days_from_sunday(), local.hour())
        }
        None => (
            instant.month(),
            instant.weekday().num_days_from_sunday(),
            instant.hour(),
        ),
    }
}

/// Build the normalized row for a geotagged item from a resolver response.
///
/// An empty or unknown zone name falls back to UTC and is stored as empty.
pub fn derive(
    item: &ActivityItem,
    latitude: f64,
    longitude: f64,
    zone_name: Option<&str>,
) -> NormalizedActivity {
    let zone = zone_name.and_then(|name| name.parse::<Tz>().ok());
    if zone.is_none()
        && let Some(name) = zone_name.filter(|n| !n.is_empty())
    {
        warn_once(format!("unknown time zone name {name:?}, using UTC"));
    }
    let (month, weekday, hour_of_day) = local_buckets(item.created_at, zone);
    NormalizedActivity {
        activity_id: item.activity_id,
        user_id: item.user_id,
        created_at: item.created_at,
        latitude,
        longitude,
        month,
        weekday,
        hour_of_day,
        time_zone: zone.map(|tz| tz.name().to_string()).unwrap_or_default(),
    }
}

/// Resolves zones for activity items and derives their normalized rows.
#[derive(Clone)]
pub struct Normalizer {
    resolver: Arc<dyn TimeZoneResolver>,
}

impl Normalizer {
    pub fn new(resolver: Arc<dyn TimeZoneResolver>) -> Self {
        Self { resolver }
    }

    /// `None` for items without coordinates.
    pub fn normalize(&self, item: &ActivityItem) -> Option<NormalizedActivity> {
        let (latitude, longitude) = item.coordinates()?;
        let zone_name = self.resolver.resolve(latitude, longitude);
        if zone_name.is_none() {
            warn_once(format!(
                "failed to resolve time zone near {latitude:.1} {longitude:.1}"
            ));
        }
        Some(derive(item, latitude, longitude, zone_name.as_deref()))
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(TzSearchResolver))
    }
}

/// Resolver that answers one fixed zone, or nothing.
#[cfg(test)]
pub(crate) struct FixedResolver(pub Option<&'static str>);

#[cfg(test)]
impl TimeZoneResolver for FixedResolver {
    fn resolve(&self, _latitude: f64, _longitude: f64) -> Option<String> {
        self.0.map(str::to_string)
    }
}
