use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use simd_json::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::normalize::Normalizer;
use crate::types::{ActivityItem, ProfileSnapshot, Summary, UserRecord};

/// Timestamp layout of the export, e.g. `Mon Nov 20 10:15:00 +0000 2017`.
pub const EXPORT_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

// EXPORT JSONL SCHEMA

#[derive(Debug, Deserialize)]
struct ExportRecord {
    created_at: String,
    id: i64,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    coordinates: Option<ExportCoordinates>,
    user: ExportUser,
}

#[derive(Debug, Deserialize)]
struct ExportCoordinates {
    // Anything but a two-number array leaves the record without a location.
    #[serde(default)]
    coordinates: Option<simd_json::OwnedValue>,
}

#[derive(Debug, Deserialize)]
struct ExportUser {
    id: i64,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    utc_offset: Option<i32>,
    #[serde(default)]
    time_zone: Option<String>,
}

/// A record whose timestamp parsed, ready for ordering.
#[derive(Debug)]
struct TimedRecord {
    created_at: DateTime<Utc>,
    record: ExportRecord,
}

impl TimedRecord {
    /// `(latitude, longitude)` when exactly two coordinate values were present.
    fn coordinates(&self) -> Option<(f64, f64)> {
        let inner = self.record.coordinates.as_ref()?.coordinates.as_ref()?;
        let values = inner.as_array()?;
        match values.as_slice() {
            [longitude, latitude] => Some((latitude.cast_f64()?, longitude.cast_f64()?)),
            _ => None,
        }
    }
}

pub fn parse_export_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(value, EXPORT_TIME_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::MalformedInput(format!("timestamp {value:?}: {e}")))
}

fn parse_line(line: &[u8]) -> Result<TimedRecord> {
    // simd-json parses in place
    let mut buf = line.to_vec();
    let record: ExportRecord = simd_json::from_slice(&mut buf)
        .map_err(|e| Error::MalformedInput(format!("record: {e}")))?;
    let created_at = parse_export_time(&record.created_at)?;
    Ok(TimedRecord { created_at, record })
}

/// Result of parsing one user's concatenated export.
#[derive(Debug)]
pub struct ParsedGroup {
    pub user: UserRecord,
    pub summary: Summary,
}

/// Parse a user group's newline-delimited payload into one ordered, deduplicated record.
///
/// Unparsable lines are dropped and counted. Fails with `CrossUserMismatch`
/// when records disagree on the user id and with `EmptyGroup` when nothing parsed.
pub fn parse_group(payload: &[u8], normalizer: &Normalizer) -> Result<ParsedGroup> {
    let mut summary = Summary::default();
    let mut records = Vec::new();

    for (i, line) in payload.split(|b| *b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_line(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                summary.malformed += 1;
                debug!("dropping line {}: {e}", i + 1);
            }
        }
    }

    if records.is_empty() {
        return Err(Error::EmptyGroup);
    }

    records.sort_by_key(|r| r.created_at);
    let user = build_user(&records, normalizer, &mut summary)?;
    Ok(ParsedGroup { user, summary })
}

fn build_user(
    records: &[TimedRecord],
    normalizer: &Normalizer,
    summary: &mut Summary,
) -> Result<UserRecord> {
    let mut user = UserRecord {
        id: records[0].record.user.id,
        ..UserRecord::default()
    };
    let mut seen = HashSet::with_capacity(records.len());

    for timed in records {
        let record = &timed.record;
        if record.user.id != user.id {
            return Err(Error::CrossUserMismatch {
                expected: user.id,
                found: record.user.id,
            });
        }
        summary.records += 1;
        if !seen.insert(record.id) {
            summary.duplicates += 1;
            continue;
        }
        summary.unique += 1;

        let coordinates = timed.coordinates();
        let item = ActivityItem {
            activity_id: record.id,
            user_id: user.id,
            created_at: timed.created_at,
            language: record.lang.clone().unwrap_or_default(),
            latitude: coordinates.map(|c| c.0),
            longitude: coordinates.map(|c| c.1),
        };
        if let Some(normalized) = normalizer.normalize(&item) {
            summary.geotagged += 1;
            user.geotagged.push(normalized);
        }
        user.timeline.push(item);

        let profile = ProfileSnapshot {
            activity_id: record.id,
            user_id: user.id,
            created_at: timed.created_at,
            language: record.user.lang.clone().unwrap_or_default(),
            utc_offset: record.user.utc_offset,
            time_zone: record.user.time_zone.clone().unwrap_or_default(),
        };
        if user
            .profiles
            .last()
            .is_none_or(|last| !last.same_profile(&profile))
        {
            user.profiles.push(profile);
        }
    }

    Ok(user)
}

#[cfg(test)]
mod tests;
