use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::locate::LocateMethod;
use crate::pipeline::StorageErrorPolicy;
use crate::utils::NumberFormatOptions;

pub const DEFAULT_LOCATE_FILTER: &str =
    "(hour_of_day < 10 or hour_of_day > 20) and weekday < 6 and weekday > 0";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
    pub geohash: GeohashConfig,
    pub locate: LocateConfig,
    pub regions: RegionsConfig,
    pub formatting: FormattingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch_users: usize,
    pub progress_every: u64,
    pub file_pattern: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnStorageError {
    Abort,
    Retry,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub on_error: OnStorageError,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub radius_km: f64,
    pub min_points: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeohashConfig {
    pub precision: usize,
    pub confidence_threshold: f64,
    pub min_usable_length: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LocateConfig {
    pub method: LocateMethod,
    pub filter: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegionsConfig {
    pub name_property: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FormattingConfig {
    pub number_comma: bool,
    pub number_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("homeloc.sqlite3"),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            workers: 10,
            batch_users: 1000,
            progress_every: 1000,
            file_pattern: "User*".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            on_error: OnStorageError::Abort,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius_km: 0.1,
            min_points: 2,
        }
    }
}

impl Default for GeohashConfig {
    fn default() -> Self {
        Self {
            precision: 12,
            confidence_threshold: 0.1,
            min_usable_length: 1,
        }
    }
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            method: LocateMethod::Cluster,
            filter: DEFAULT_LOCATE_FILTER.to_string(),
        }
    }
}

impl Default for RegionsConfig {
    fn default() -> Self {
        Self {
            name_property: "SOVEREIGN".to_string(),
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            number_comma: true,
            number_human: false,
            locale: "en".to_string(),
            decimal_places: 2,
        }
    }
}

impl StorageConfig {
    pub fn policy(&self) -> StorageErrorPolicy {
        match self.on_error {
            OnStorageError::Abort => StorageErrorPolicy::Abort,
            OnStorageError::Retry => StorageErrorPolicy::Retry {
                attempts: self.retry_attempts,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }
}

impl FormattingConfig {
    pub fn number_options(&self) -> NumberFormatOptions {
        NumberFormatOptions {
            use_comma: self.number_comma,
            use_human: self.number_human,
            locale: self.locale.clone(),
            decimal_places: self.decimal_places,
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".homeloc.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(value: &str, what: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("Invalid {what} value: {value}"))
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("Created default configuration file.");
        println!("Edit it directly or use:");
        println!("   homeloc config set database-path /data/homeloc.sqlite3");
        println!("at {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            println!("Current configuration:");
            println!("   Database: {}", config.database.path.display());
            println!(
                "   Ingest: {} workers, queue {}, batch {} users, progress every {}, pattern {:?}",
                config.ingest.workers,
                config.ingest.queue_capacity,
                config.ingest.batch_users,
                config.ingest.progress_every,
                config.ingest.file_pattern
            );
            match config.storage.on_error {
                OnStorageError::Abort => println!("   On Storage Error: abort"),
                OnStorageError::Retry => println!(
                    "   On Storage Error: retry {} times, {} ms backoff",
                    config.storage.retry_attempts, config.storage.retry_backoff_ms
                ),
            }
            println!(
                "   Cluster: radius {} km, min points {}",
                config.cluster.radius_km, config.cluster.min_points
            );
            println!(
                "   Geohash: precision {}, threshold {}, min usable length {}",
                config.geohash.precision,
                config.geohash.confidence_threshold,
                config.geohash.min_usable_length
            );
            println!("   Locate Method: {}", config.locate.method);
            println!("   Locate Filter: {}", config.locate.filter);
            println!("   Region Property: {}", config.regions.name_property);
            println!("   Number Comma: {}", config.formatting.number_comma);
            println!("   Number Human: {}", config.formatting.number_human);
            println!("   Locale: {}", config.formatting.locale);
            println!("   Decimal Places: {}", config.formatting.decimal_places);
        }
        None => {
            println!("No configuration file found.");
            println!("   Run 'homeloc config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();
    apply_config_value(&mut config, key, value)?;
    config.save(false)?;
    Ok(())
}

fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "database-path" => config.database.path = PathBuf::from(value),
        "workers" => config.ingest.workers = positive(parse_value(value, "number")?, key)?,
        "queue-capacity" => {
            config.ingest.queue_capacity = positive(parse_value(value, "number")?, key)?
        }
        "batch-users" => config.ingest.batch_users = positive(parse_value(value, "number")?, key)?,
        "progress-every" => config.ingest.progress_every = parse_value(value, "number")?,
        "file-pattern" => {
            glob::Pattern::new(value).context("Invalid glob pattern")?;
            config.ingest.file_pattern = value.to_string();
        }
        "on-storage-error" => {
            config.storage.on_error = match value {
                "abort" => OnStorageError::Abort,
                "retry" => OnStorageError::Retry,
                _ => anyhow::bail!("Invalid storage error policy: {value} (use 'abort' or 'retry')"),
            }
        }
        "retry-attempts" => config.storage.retry_attempts = parse_value(value, "number")?,
        "retry-backoff-ms" => config.storage.retry_backoff_ms = parse_value(value, "number")?,
        "radius-km" => {
            let radius: f64 = parse_value(value, "number")?;
            if !(radius.is_finite() && radius > 0.0) {
                anyhow::bail!("radius-km must be a positive number");
            }
            config.cluster.radius_km = radius;
        }
        "min-points" => config.cluster.min_points = positive(parse_value(value, "number")?, key)?,
        "geohash-precision" => {
            let precision: usize = parse_value(value, "number")?;
            if !(1..=12).contains(&precision) {
                anyhow::bail!("geohash-precision must be between 1 and 12");
            }
            config.geohash.precision = precision;
        }
        "confidence-threshold" => {
            let threshold: f64 = parse_value(value, "number")?;
            if !(0.0..=1.0).contains(&threshold) {
                anyhow::bail!("confidence-threshold must be between 0 and 1");
            }
            config.geohash.confidence_threshold = threshold;
        }
        "min-usable-length" => config.geohash.min_usable_length = parse_value(value, "number")?,
        "locate-method" => {
            config.locate.method = LocateMethod::parse(value).with_context(|| {
                format!("Invalid locate method: {value} (use 'cluster', 'geohash' or 'auto')")
            })?
        }
        "locate-filter" => config.locate.filter = value.to_string(),
        "region-property" => config.regions.name_property = value.to_string(),
        "number-comma" => {
            config.formatting.number_comma = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
        }
        "number-human" => {
            config.formatting.number_human = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
        }
        "locale" => config.formatting.locale = value.to_string(),
        "decimal-places" => config.formatting.decimal_places = parse_value(value, "number")?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}

fn positive(n: usize, key: &str) -> Result<usize> {
    if n == 0 {
        anyhow::bail!("{key} must be at least 1");
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let config_path = dir.path().join(".homeloc.toml");
        set_test_config_path(config_path.clone());
        (dir, config_path)
    }

    #[test]
    fn default_config_round_trip() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let loaded = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(loaded.ingest.workers, 10);
        assert_eq!(loaded.ingest.queue_capacity, 50);
        assert_eq!(loaded.ingest.batch_users, 1000);
        assert_eq!(loaded.storage.on_error, OnStorageError::Abort);
        assert_eq!(loaded.cluster.min_points, 2);
        assert_eq!(loaded.geohash.precision, 12);
        assert_eq!(loaded.locate.method, LocateMethod::Cluster);
        assert_eq!(loaded.locate.filter, DEFAULT_LOCATE_FILTER);
        assert_eq!(loaded.regions.name_property, "SOVEREIGN");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[ingest]\nworkers = 4\n\n[storage]\non_error = \"retry\"\n").unwrap();

        let cfg = Config::load().unwrap().unwrap();
        assert_eq!(cfg.ingest.workers, 4);
        assert_eq!(cfg.ingest.file_pattern, "User*");
        assert_eq!(
            cfg.storage.policy(),
            StorageErrorPolicy::Retry {
                attempts: 3,
                backoff: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn missing_file_loads_as_none() {
        let (_dir, _path) = setup_test_config();
        assert!(Config::load().unwrap().is_none());
    }

    #[test]
    fn set_config_value_behaviour() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        set_config_value("database-path", "/tmp/geo.sqlite3").expect("set database-path");
        set_config_value("workers", "4").expect("set workers");
        set_config_value("on-storage-error", "retry").expect("set on-storage-error");
        set_config_value("radius-km", "0.25").expect("set radius-km");
        set_config_value("geohash-precision", "9").expect("set geohash-precision");
        set_config_value("locate-method", "auto").expect("set locate-method");
        set_config_value("region-property", "NAME").expect("set region-property");

        let cfg = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(cfg.database.path, PathBuf::from("/tmp/geo.sqlite3"));
        assert_eq!(cfg.ingest.workers, 4);
        assert_eq!(cfg.storage.on_error, OnStorageError::Retry);
        assert_eq!(cfg.cluster.radius_km, 0.25);
        assert_eq!(cfg.geohash.precision, 9);
        assert_eq!(cfg.locate.method, LocateMethod::Auto);
        assert_eq!(cfg.regions.name_property, "NAME");

        let err = set_config_value("unknown-key", "value").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Unknown config key"),
            "unexpected error message: {msg}"
        );
        let err = set_config_value("workers", "0").unwrap_err();
        assert!(format!("{err}").contains("at least 1"));
        let err = set_config_value("geohash-precision", "13").unwrap_err();
        assert!(format!("{err}").contains("between 1 and 12"));
        let err = set_config_value("number-comma", "not-a-bool").unwrap_err();
        assert!(format!("{err}").contains("Invalid boolean value"));
    }
}
