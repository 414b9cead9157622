//! SQLite persistence for normalized activity, profiles and location estimates.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{
    EstimateMethod, LocationCalc, LocationEstimate, NormalizedActivity, ProfileSnapshot,
};

/// Storage used by the ingest writer and the location commands.
///
/// A repository is owned by a single task at a time.
pub trait Repository {
    /// Create missing tables. Fails with `Error::Schema` if an existing table
    /// has a different shape.
    fn create_tables(&self) -> Result<()>;

    /// Append one batch in a single transaction.
    fn insert_batch(
        &mut self,
        activities: &[NormalizedActivity],
        profiles: &[ProfileSnapshot],
    ) -> Result<()>;

    /// Normalized activity matching a SQL boolean expression over the
    /// `activities` columns. An empty filter selects everything.
    fn list_activities(&self, filter: &str) -> Result<Vec<NormalizedActivity>>;

    fn insert_calc(&mut self, calc: &LocationCalc) -> Result<()>;

    fn insert_estimates(&mut self, calc_name: &str, estimates: &[LocationEstimate])
    -> Result<()>;

    fn list_estimates(&self, calc_name: &str) -> Result<Vec<LocationEstimate>>;
}

/// Table name, DDL, expected columns and index DDL run after the column check.
const TABLES: &[(&str, &str, &[&str], &str)] = &[
    (
        "activities",
        "CREATE TABLE IF NOT EXISTS activities (
            activity_id INTEGER NOT NULL PRIMARY KEY,
            user_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            month INTEGER NOT NULL,
            weekday INTEGER NOT NULL,
            hour_of_day INTEGER NOT NULL,
            time_zone TEXT NOT NULL
        );",
        &[
            "activity_id",
            "user_id",
            "created_at",
            "latitude",
            "longitude",
            "month",
            "weekday",
            "hour_of_day",
            "time_zone",
        ],
        "CREATE INDEX IF NOT EXISTS activities_user_id ON activities(user_id);",
    ),
    (
        "profiles",
        "CREATE TABLE IF NOT EXISTS profiles (
            activity_id INTEGER NOT NULL PRIMARY KEY,
            user_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            language TEXT NOT NULL,
            utc_offset INTEGER,
            time_zone TEXT NOT NULL
        );",
        &[
            "activity_id",
            "user_id",
            "created_at",
            "language",
            "utc_offset",
            "time_zone",
        ],
        "CREATE INDEX IF NOT EXISTS profiles_user_id ON profiles(user_id);",
    ),
    (
        "location_calcs",
        "CREATE TABLE IF NOT EXISTS location_calcs (
            name TEXT NOT NULL PRIMARY KEY,
            method TEXT NOT NULL,
            cluster_radius_km REAL NOT NULL,
            min_points INTEGER NOT NULL,
            geohash_precision INTEGER NOT NULL,
            confidence_threshold REAL NOT NULL,
            activity_filter TEXT NOT NULL
        );",
        &[
            "name",
            "method",
            "cluster_radius_km",
            "min_points",
            "geohash_precision",
            "confidence_threshold",
            "activity_filter",
        ],
        "",
    ),
    (
        "locations",
        "CREATE TABLE IF NOT EXISTS locations (
            user_id INTEGER NOT NULL,
            calc_name TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            confidence REAL NOT NULL,
            total_samples INTEGER NOT NULL,
            method TEXT NOT NULL,
            share_vs_runner_up REAL,
            geohash TEXT,
            low_confidence INTEGER NOT NULL,
            PRIMARY KEY (user_id, calc_name)
        );",
        &[
            "user_id",
            "calc_name",
            "latitude",
            "longitude",
            "confidence",
            "total_samples",
            "method",
            "share_vs_runner_up",
            "geohash",
            "low_confidence",
        ],
        "",
    ),
];

const ACTIVITY_COLUMNS: &str = "activity_id, user_id, created_at, latitude, longitude, month, weekday, hour_of_day, time_zone";

pub struct SqliteRepository {
    conn: Connection,
}

impl SqliteRepository {
    /// Open (or create) a database tuned for single-writer bulk loading.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(50))?;
        conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        info!("opened database {}", path.display());
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn check_table(&self, table: &str, expected: &[&str]) -> Result<()> {
        let mut found = self.table_columns(table)?;
        let mut wanted: Vec<String> = expected.iter().map(|c| c.to_string()).collect();
        found.sort();
        wanted.sort();
        if found != wanted {
            return Err(Error::Schema {
                table: table.to_string(),
                reason: format!("expected columns {wanted:?}, found {found:?}"),
            });
        }
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<NormalizedActivity> {
    let created_at: String = row.get(2)?;
    Ok(NormalizedActivity {
        activity_id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: parse_timestamp(&created_at)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        month: row.get(5)?,
        weekday: row.get(6)?,
        hour_of_day: row.get(7)?,
        time_zone: row.get(8)?,
    })
}

fn estimate_from_row(row: &Row<'_>) -> rusqlite::Result<LocationEstimate> {
    let method: String = row.get(5)?;
    let total_samples: i64 = row.get(4)?;
    Ok(LocationEstimate {
        user_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        confidence: row.get(3)?,
        total_samples: total_samples as usize,
        method: EstimateMethod::parse(&method).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown method {method:?}").into(),
            )
        })?,
        share_vs_runner_up: row.get(6)?,
        geohash: row.get(7)?,
        low_confidence: row.get(8)?,
    })
}

impl Repository for SqliteRepository {
    fn create_tables(&self) -> Result<()> {
        for (table, ddl, columns, indexes) in TABLES {
            self.conn.execute_batch(ddl)?;
            self.check_table(table, columns)?;
            self.conn.execute_batch(indexes)?;
        }
        Ok(())
    }

    fn insert_batch(
        &mut self,
        activities: &[NormalizedActivity],
        profiles: &[ProfileSnapshot],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO activities({ACTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for a in activities {
                stmt.execute(params![
                    a.activity_id,
                    a.user_id,
                    a.created_at.to_rfc3339(),
                    a.latitude,
                    a.longitude,
                    a.month,
                    a.weekday,
                    a.hour_of_day,
                    a.time_zone,
                ])?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO profiles(activity_id, user_id, created_at, language, utc_offset, time_zone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for p in profiles {
                stmt.execute(params![
                    p.activity_id,
                    p.user_id,
                    p.created_at.to_rfc3339(),
                    p.language,
                    p.utc_offset,
                    p.time_zone,
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "committed {} activities and {} profiles",
            activities.len(),
            profiles.len()
        );
        Ok(())
    }

    fn list_activities(&self, filter: &str) -> Result<Vec<NormalizedActivity>> {
        let mut sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities");
        if !filter.trim().is_empty() {
            sql.push_str(&format!(" WHERE ({filter})"));
        }
        sql.push_str(" ORDER BY user_id, created_at");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], activity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_calc(&mut self, calc: &LocationCalc) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO location_calcs(name, method, cluster_radius_km, min_points, geohash_precision, confidence_threshold, activity_filter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                calc.name,
                calc.method,
                calc.cluster_radius_km,
                calc.min_points as i64,
                calc.geohash_precision as i64,
                calc.confidence_threshold,
                calc.activity_filter,
            ],
        )?;
        Ok(())
    }

    fn insert_estimates(
        &mut self,
        calc_name: &str,
        estimates: &[LocationEstimate],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO locations(user_id, calc_name, latitude, longitude, confidence, total_samples, method, share_vs_runner_up, geohash, low_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for e in estimates {
                stmt.execute(params![
                    e.user_id,
                    calc_name,
                    e.latitude,
                    e.longitude,
                    e.confidence,
                    e.total_samples as i64,
                    e.method.as_str(),
                    e.share_vs_runner_up,
                    e.geohash,
                    e.low_confidence,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_estimates(&self, calc_name: &str) -> Result<Vec<LocationEstimate>> {
        let known: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM location_calcs WHERE name = ?1",
                [calc_name],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(Error::UnknownCalc(calc_name.to_string()));
        }

        let mut stmt = self.conn.prepare(
            "SELECT user_id, latitude, longitude, confidence, total_samples, method, share_vs_runner_up, geohash, low_confidence
             FROM locations WHERE calc_name = ?1 ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map([calc_name], estimate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn activity(id: i64, user: i64, hour: u32, weekday: u32) -> NormalizedActivity {
        NormalizedActivity {
            activity_id: id,
            user_id: user,
            created_at: Utc.with_ymd_and_hms(2017, 11, 20, hour, 0, 0).unwrap(),
            latitude: 59.33,
            longitude: 18.06,
            month: 11,
            weekday,
            hour_of_day: hour,
            time_zone: "Europe/Stockholm".into(),
        }
    }

    fn profile(id: i64, user: i64) -> ProfileSnapshot {
        ProfileSnapshot {
            activity_id: id,
            user_id: user,
            created_at: Utc.with_ymd_and_hms(2017, 11, 20, 8, 0, 0).unwrap(),
            language: "sv".into(),
            utc_offset: None,
            time_zone: "Stockholm".into(),
        }
    }

    fn repo() -> SqliteRepository {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_tables().unwrap();
        repo
    }

    #[test]
    fn create_tables_is_idempotent() {
        let repo = repo();
        repo.create_tables().expect("second create succeeds");
    }

    #[test]
    fn create_tables_rejects_incompatible_table() {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.conn
            .execute_batch("CREATE TABLE activities (id INTEGER PRIMARY KEY, text TEXT);")
            .unwrap();
        let err = repo.create_tables().unwrap_err();
        assert!(matches!(err, Error::Schema { ref table, .. } if table == "activities"));
    }

    #[test]
    fn batch_round_trip_with_filter() {
        let mut repo = repo();
        let rows = vec![activity(1, 7, 22, 2), activity(2, 7, 14, 2), activity(3, 8, 6, 0)];
        repo.insert_batch(&rows, &[profile(1, 7)]).unwrap();
        // Re-inserting the same batch is ignored.
        repo.insert_batch(&rows, &[profile(1, 7)]).unwrap();

        let all = repo.list_activities("").unwrap();
        let ids: Vec<i64> = all.iter().map(|a| a.activity_id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(all[1], rows[0]);

        let night = repo
            .list_activities("(hour_of_day < 10 or hour_of_day > 20) and weekday < 6 and weekday > 0")
            .unwrap();
        assert_eq!(night.len(), 1);
        assert_eq!(night[0].activity_id, 1);
    }

    #[test]
    fn bad_filter_is_a_storage_error() {
        let repo = repo();
        assert!(matches!(
            repo.list_activities("no_such_column = 1"),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn estimates_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut repo = SqliteRepository::open(&dir.path().join("db.sqlite3")).unwrap();
        repo.create_tables().unwrap();
        repo.insert_calc(&LocationCalc {
            name: "night".into(),
            method: "cluster".into(),
            cluster_radius_km: 0.1,
            min_points: 2,
            geohash_precision: 12,
            confidence_threshold: 0.1,
            activity_filter: String::new(),
        })
        .unwrap();

        let estimate = LocationEstimate {
            user_id: 7,
            latitude: 59.33,
            longitude: 18.06,
            confidence: 0.75,
            total_samples: 12,
            method: EstimateMethod::Geohash,
            share_vs_runner_up: None,
            geohash: Some("u6sce".into()),
            low_confidence: false,
        };
        repo.insert_estimates("night", std::slice::from_ref(&estimate))
            .unwrap();

        assert_eq!(repo.list_estimates("night").unwrap(), vec![estimate]);
        assert!(matches!(
            repo.list_estimates("other"),
            Err(Error::UnknownCalc(name)) if name == "other"
        ));
    }
}
