use crate::query::QueryLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration loaded from environment variables or TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// DuckDB database file. Unset means an in-memory database.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Maximum number of grouped rows, not counting the overall row.
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,
    #[serde(default = "default_percentile_lower")]
    pub percentile_lower: f64,
    #[serde(default = "default_percentile_upper")]
    pub percentile_upper: f64,
    /// Decimal places kept on average step times.
    #[serde(default = "default_time_precision")]
    pub time_precision: u32,
    /// Query timeout in seconds (default: 30). 0 = no timeout.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

const fn default_max_steps() -> usize {
    10
}

const fn default_result_limit() -> usize {
    100
}

const fn default_bucket_count() -> u32 {
    8
}

const fn default_percentile_lower() -> f64 {
    0.02
}

const fn default_percentile_upper() -> f64 {
    0.98
}

const fn default_time_precision() -> u32 {
    2
}

const fn default_query_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            max_steps: default_max_steps(),
            result_limit: default_result_limit(),
            bucket_count: default_bucket_count(),
            percentile_lower: default_percentile_lower(),
            percentile_upper: default_percentile_upper(),
            time_precision: default_time_precision(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Environment variables override file values:
    /// - `MALLARD_DB_PATH` → db_path
    /// - `MALLARD_MAX_STEPS` → max_steps
    /// - `MALLARD_RESULT_LIMIT` → result_limit
    /// - `MALLARD_BUCKET_COUNT` → bucket_count
    /// - `MALLARD_PERCENTILE_LOWER` → percentile_lower
    /// - `MALLARD_PERCENTILE_UPPER` → percentile_upper
    /// - `MALLARD_TIME_PRECISION` → time_precision
    /// - `MALLARD_QUERY_TIMEOUT` → query_timeout_secs
    ///
    /// Out-of-range limits are reset to their defaults with a warning.
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut config =
            config_path.map_or_else(Self::default, |path| match std::fs::read_to_string(path) {
                Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse config file: {e}, using defaults");
                    Self::default()
                }),
                Err(e) => {
                    tracing::warn!("Failed to read config file: {e}, using defaults");
                    Self::default()
                }
            });

        // Environment variable overrides
        if let Ok(path) = std::env::var("MALLARD_DB_PATH") {
            config.db_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(v) = env_parse("MALLARD_MAX_STEPS") {
            config.max_steps = v;
        }
        if let Some(v) = env_parse("MALLARD_RESULT_LIMIT") {
            config.result_limit = v;
        }
        if let Some(v) = env_parse("MALLARD_BUCKET_COUNT") {
            config.bucket_count = v;
        }
        if let Some(v) = env_parse("MALLARD_PERCENTILE_LOWER") {
            config.percentile_lower = v;
        }
        if let Some(v) = env_parse("MALLARD_PERCENTILE_UPPER") {
            config.percentile_upper = v;
        }
        if let Some(v) = env_parse("MALLARD_TIME_PRECISION") {
            config.time_precision = v;
        }
        if let Some(v) = env_parse("MALLARD_QUERY_TIMEOUT") {
            config.query_timeout_secs = v;
        }

        config.sanitize();
        config
    }

    fn sanitize(&mut self) {
        if self.max_steps == 0 {
            tracing::warn!("max_steps must be positive, using {}", default_max_steps());
            self.max_steps = default_max_steps();
        }
        if self.result_limit == 0 {
            tracing::warn!("result_limit must be positive, using {}", default_result_limit());
            self.result_limit = default_result_limit();
        }
        if self.bucket_count == 0 {
            tracing::warn!("bucket_count must be positive, using {}", default_bucket_count());
            self.bucket_count = default_bucket_count();
        }
        let ordered = 0.0 <= self.percentile_lower
            && self.percentile_lower < self.percentile_upper
            && self.percentile_upper <= 1.0;
        if !ordered {
            tracing::warn!(
                lower = self.percentile_lower,
                upper = self.percentile_upper,
                "Invalid bucketing percentiles, using defaults"
            );
            self.percentile_lower = default_percentile_lower();
            self.percentile_upper = default_percentile_upper();
        }
        if self.time_precision > 9 {
            tracing::warn!("time_precision {} is too large, using 9", self.time_precision);
            self.time_precision = 9;
        }
    }

    /// Compiler and post-processor limits derived from this configuration.
    pub const fn limits(&self) -> QueryLimits {
        QueryLimits {
            max_steps: self.max_steps,
            result_limit: self.result_limit,
            bucket_count: self.bucket_count,
            percentile_lower: self.percentile_lower,
            percentile_upper: self.percentile_upper,
            time_precision: self.time_precision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// Mutex to serialize tests that call `Config::load`, which reads
    /// environment variables. Without this, `test_env_var_overrides` can
    /// pollute other tests running in parallel.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.db_path.is_none());
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.result_limit, 100);
        assert_eq!(config.bucket_count, 8);
        assert!((config.percentile_lower - 0.02).abs() < f64::EPSILON);
        assert!((config.percentile_upper - 0.98).abs() < f64::EPSILON);
        assert_eq!(config.time_precision, 2);
        assert_eq!(config.query_timeout_secs, 30);
        assert_eq!(config.limits(), QueryLimits::default());
    }

    #[test]
    fn test_load_from_toml() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"
db_path = "/data/analytics.duckdb"
max_steps = 5
result_limit = 20
bucket_count = 4
percentile_lower = 0.05
percentile_upper = 0.95
time_precision = 1
query_timeout_secs = 10
"#
        )
        .unwrap();

        let config = Config::load(Some(&config_path));
        assert_eq!(config.db_path, Some(PathBuf::from("/data/analytics.duckdb")));
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.result_limit, 20);
        assert_eq!(config.bucket_count, 4);
        assert!((config.percentile_lower - 0.05).abs() < f64::EPSILON);
        assert!((config.percentile_upper - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.time_precision, 1);
        assert_eq!(config.query_timeout_secs, 10);

        let limits = config.limits();
        assert_eq!(limits.max_steps, 5);
        assert_eq!(limits.bucket_count, 4);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = Config::load(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.max_steps, 10);
    }

    #[test]
    fn test_load_no_path_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = Config::load(None);
        assert_eq!(config.result_limit, 100);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_invalid_limits_are_reset() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "max_steps = 0\nresult_limit = 0\nbucket_count = 0\npercentile_lower = 0.9\npercentile_upper = 0.1\n",
        )
        .unwrap();

        let config = Config::load(Some(&config_path));
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.result_limit, 100);
        assert_eq!(config.bucket_count, 8);
        assert!((config.percentile_lower - 0.02).abs() < f64::EPSILON);
        assert!((config.percentile_upper - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_var_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        // Save original values
        let orig_steps = std::env::var("MALLARD_MAX_STEPS").ok();
        let orig_limit = std::env::var("MALLARD_RESULT_LIMIT").ok();

        std::env::set_var("MALLARD_MAX_STEPS", "3");
        std::env::set_var("MALLARD_RESULT_LIMIT", "not a number");
        let config = Config::load(None);
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.result_limit, 100);

        // Restore
        for (name, orig) in [
            ("MALLARD_MAX_STEPS", orig_steps),
            ("MALLARD_RESULT_LIMIT", orig_limit),
        ] {
            match orig {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
    }

    #[test]
    fn test_invalid_toml_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "this is not valid toml {{{").unwrap();

        let config = Config::load(Some(&config_path));
        assert_eq!(config.max_steps, 10);
    }
}
