// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    BUCKET_COMPLETENESS_AGE, CLAIM_STALENESS_THRESHOLD, DEFAULT_WORKERS_MAX_COUNT,
    DEFAULT_WORKERS_MIN_COUNT, SWEEP_PERIOD,
};
use crate::error::ConfigError;
use crate::readiness::ReadinessBackoff;
use crate::uploader::BlobConnection;

const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 15 * 60;
const DEFAULT_UPLOAD_MAX_RETRIES: u32 = 3;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one subdirectory per spool root
    pub disk_path: PathBuf,
    pub blob_connection: BlobConnection,
    pub workers_min_count: usize,
    pub workers_max_count: usize,
    /// is-alive URL polled before the first sweep, no gate when unset
    pub readiness_url: Option<String>,
    pub readiness_backoff: ReadinessBackoff,
    /// Timeout for each storage request, in seconds
    pub upload_timeout_secs: u64,
    /// Attempts per storage request before giving up
    pub upload_max_retries: u32,
    pub https_proxy: Option<String>,
    pub log_level: String,
    pub sweep_period: Duration,
    /// Delay between the start of two consecutive workers of a cycle
    pub worker_stagger: Duration,
    pub claim_ttl: Duration,
    pub bucket_completeness_age: Duration,
}

impl Config {
    /// Configuration with every optional setting at its default.
    pub fn new(disk_path: impl Into<PathBuf>, blob_connection: BlobConnection) -> Self {
        Config {
            disk_path: disk_path.into(),
            blob_connection,
            workers_min_count: DEFAULT_WORKERS_MIN_COUNT,
            workers_max_count: DEFAULT_WORKERS_MAX_COUNT,
            readiness_url: None,
            readiness_backoff: ReadinessBackoff::default(),
            upload_timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
            upload_max_retries: DEFAULT_UPLOAD_MAX_RETRIES,
            https_proxy: None,
            log_level: "info".to_string(),
            sweep_period: SWEEP_PERIOD,
            worker_stagger: SWEEP_PERIOD,
            claim_ttl: CLAIM_STALENESS_THRESHOLD,
            bucket_completeness_age: BUCKET_COMPLETENESS_AGE,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let disk_path = env::var("SPOOL_DISK_PATH")
            .map_err(|_| ConfigError::Missing("SPOOL_DISK_PATH"))?;
        let connection_string = env::var("SPOOL_BLOB_CONNECTION_STRING")
            .map_err(|_| ConfigError::Missing("SPOOL_BLOB_CONNECTION_STRING"))?;
        let blob_connection = BlobConnection::parse(&connection_string)?;

        let mut config = Config::new(disk_path, blob_connection);

        let (min, max) = resolve_worker_bounds(
            env_parse::<i64>("SPOOL_WORKERS_MIN_COUNT").unwrap_or(0),
            env_parse::<i64>("SPOOL_WORKERS_MAX_COUNT").unwrap_or(0),
        );
        config.workers_min_count = min;
        config.workers_max_count = max;

        config.readiness_url = env::var("SPOOL_READINESS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        if let Some(initial_ms) = env_parse::<u64>("SPOOL_READINESS_BACKOFF_INITIAL_MS") {
            config.readiness_backoff.initial = Duration::from_millis(initial_ms);
        }
        if let Some(max_ms) = env_parse::<u64>("SPOOL_READINESS_BACKOFF_MAX_MS") {
            config.readiness_backoff.max = Duration::from_millis(max_ms);
        }

        if let Some(timeout) = env_parse::<u64>("SPOOL_UPLOAD_TIMEOUT_SECS") {
            config.upload_timeout_secs = timeout;
        }
        if let Some(retries) = env_parse::<u32>("SPOOL_UPLOAD_MAX_RETRIES") {
            config.upload_max_retries = retries;
        }
        config.https_proxy = env::var("SPOOL_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        config.log_level = env::var("SPOOL_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disk_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("SPOOL_DISK_PATH cannot be empty".into()));
        }
        if self.workers_min_count == 0 || self.workers_min_count > self.workers_max_count {
            return Err(ConfigError::Invalid(format!(
                "worker bounds [{}, {}] are not a valid range",
                self.workers_min_count, self.workers_max_count
            )));
        }
        if self.readiness_backoff.initial.is_zero()
            || self.readiness_backoff.initial > self.readiness_backoff.max
        {
            return Err(ConfigError::Invalid(
                "readiness backoff must start above zero and not exceed its maximum".into(),
            ));
        }
        if self.upload_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "SPOOL_UPLOAD_TIMEOUT_SECS must be greater than 0".into(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Applies the worker bound defaults: non-positive values fall back to 2 and 8,
/// and a minimum above the maximum lifts the maximum.
pub fn resolve_worker_bounds(min: i64, max: i64) -> (usize, usize) {
    let min = usize::try_from(min)
        .ok()
        .filter(|min| *min > 0)
        .unwrap_or(DEFAULT_WORKERS_MIN_COUNT);
    let max = usize::try_from(max)
        .ok()
        .filter(|max| *max > 0)
        .unwrap_or(DEFAULT_WORKERS_MAX_COUNT);
    (min, max.max(min))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}
