//! Coordinator configuration
//!
//! Resolution order per setting: environment variable, then the optional
//! TOML file named by `CHIRP_CONFIG`, then the compiled default.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Capture Coordinator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub bind_addr: String,
    /// SQLite database path (":memory:" supported for ad-hoc runs)
    pub database_path: PathBuf,

    /// Clip store root directory
    pub clip_store_path: PathBuf,
    /// Public URL prefix for stored clips
    pub clip_base_url: String,
    /// Asset store root directory
    pub asset_store_path: PathBuf,
    /// Public URL prefix for stored art assets
    pub asset_base_url: String,

    /// Classifier service base URL
    pub classifier_url: String,
    /// Total wall-clock budget per classifier call
    pub classifier_deadline: Duration,
    /// Generator service base URL
    pub generator_url: String,
    /// Total wall-clock budget per generator call
    pub generator_deadline: Duration,
    /// Attempts per inference call (transport/5xx/timeout retried)
    pub inference_attempts: u32,

    /// Pipeline worker pool size
    pub worker_pool_size: usize,
    /// Dispatcher queue capacity
    pub queue_capacity: usize,
    /// Per-job deadline inside the pool
    pub job_deadline: Duration,

    /// Upload ceiling in bytes
    pub max_upload_bytes: usize,
    /// Sustained per-device upload allowance per minute
    pub rate_limit_per_minute: u32,
    /// Per-device burst allowance
    pub rate_limit_burst: u32,

    /// How often the reaper scans for stuck captures
    pub reaper_interval: Duration,
    /// Age past which a non-terminal capture is orphaned
    pub reaper_max_age: Duration,

    /// Application-level ping cadence on gateway sessions
    pub ws_ping_interval: Duration,
    /// Per-subscriber event buffer size
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let workers = (num_cpus::get() * 2).max(2);
        Self {
            bind_addr: "127.0.0.1:5780".to_string(),
            database_path: PathBuf::from("chirp.db"),
            clip_store_path: PathBuf::from("data/clips"),
            clip_base_url: "http://127.0.0.1:5780/clips".to_string(),
            asset_store_path: PathBuf::from("data/assets"),
            asset_base_url: "http://127.0.0.1:5780/assets".to_string(),
            classifier_url: "http://127.0.0.1:5781".to_string(),
            classifier_deadline: Duration::from_secs(5),
            generator_url: "http://127.0.0.1:5782".to_string(),
            generator_deadline: Duration::from_secs(15),
            inference_attempts: 3,
            worker_pool_size: workers,
            queue_capacity: workers * 8,
            job_deadline: Duration::from_secs(60),
            max_upload_bytes: 10 * 1024 * 1024,
            rate_limit_per_minute: 30,
            rate_limit_burst: 10,
            reaper_interval: Duration::from_secs(30),
            reaper_max_age: Duration::from_secs(120),
            ws_ping_interval: Duration::from_secs(20),
            event_buffer: 64,
        }
    }
}

/// TOML file shape; every key optional
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    database_path: Option<PathBuf>,
    clip_store_path: Option<PathBuf>,
    clip_base_url: Option<String>,
    asset_store_path: Option<PathBuf>,
    asset_base_url: Option<String>,
    classifier_url: Option<String>,
    classifier_deadline_ms: Option<u64>,
    generator_url: Option<String>,
    generator_deadline_ms: Option<u64>,
    inference_attempts: Option<u32>,
    worker_pool_size: Option<usize>,
    queue_capacity: Option<usize>,
    job_deadline_secs: Option<u64>,
    max_upload_bytes: Option<usize>,
    rate_limit_per_minute: Option<u32>,
    rate_limit_burst: Option<u32>,
    reaper_interval_secs: Option<u64>,
    reaper_max_age_secs: Option<u64>,
    ws_ping_interval_secs: Option<u64>,
    event_buffer: Option<usize>,
}

impl Config {
    /// Load configuration from the environment and optional TOML file
    pub fn load() -> Result<Self> {
        let file = match std::env::var("CHIRP_CONFIG") {
            Ok(path) => Self::read_file(&PathBuf::from(path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    fn read_file(path: &PathBuf) -> Result<FileConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Cannot read config file {:?}: {}", path, e)))?;
        toml::from_str(&raw)
            .map_err(|e| Error::Internal(format!("Cannot parse config file {:?}: {}", path, e)))
    }

    /// Resolve every setting: env > file > default
    ///
    /// The env lookup is injected so tests do not mutate process state.
    fn resolve<F>(file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>> {
            match raw {
                Some(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|_| Error::Internal(format!("Invalid value for {}: {}", name, raw))),
                None => Ok(None),
            }
        }

        let classifier_deadline_ms = parsed("CHIRP_CLASSIFIER_DEADLINE_MS", env("CHIRP_CLASSIFIER_DEADLINE_MS"))?
            .or(file.classifier_deadline_ms);
        let generator_deadline_ms = parsed("CHIRP_GENERATOR_DEADLINE_MS", env("CHIRP_GENERATOR_DEADLINE_MS"))?
            .or(file.generator_deadline_ms);
        let job_deadline_secs =
            parsed("CHIRP_JOB_DEADLINE_SECS", env("CHIRP_JOB_DEADLINE_SECS"))?.or(file.job_deadline_secs);
        let reaper_interval_secs = parsed("CHIRP_REAPER_INTERVAL_SECS", env("CHIRP_REAPER_INTERVAL_SECS"))?
            .or(file.reaper_interval_secs);
        let reaper_max_age_secs = parsed("CHIRP_REAPER_MAX_AGE_SECS", env("CHIRP_REAPER_MAX_AGE_SECS"))?
            .or(file.reaper_max_age_secs);
        let ws_ping_interval_secs = parsed("CHIRP_WS_PING_INTERVAL_SECS", env("CHIRP_WS_PING_INTERVAL_SECS"))?
            .or(file.ws_ping_interval_secs);

        let worker_pool_size = parsed("CHIRP_WORKER_POOL_SIZE", env("CHIRP_WORKER_POOL_SIZE"))?
            .or(file.worker_pool_size)
            .unwrap_or(defaults.worker_pool_size)
            .max(1);
        let queue_capacity = parsed("CHIRP_QUEUE_CAPACITY", env("CHIRP_QUEUE_CAPACITY"))?
            .or(file.queue_capacity)
            .unwrap_or(worker_pool_size * 8)
            .max(1);

        Ok(Self {
            bind_addr: env("CHIRP_BIND_ADDR")
                .or(file.bind_addr)
                .unwrap_or(defaults.bind_addr),
            database_path: env("CHIRP_DATABASE_PATH")
                .map(PathBuf::from)
                .or(file.database_path)
                .unwrap_or(defaults.database_path),
            clip_store_path: env("CHIRP_CLIP_STORE_PATH")
                .map(PathBuf::from)
                .or(file.clip_store_path)
                .unwrap_or(defaults.clip_store_path),
            clip_base_url: env("CHIRP_CLIP_BASE_URL")
                .or(file.clip_base_url)
                .unwrap_or(defaults.clip_base_url),
            asset_store_path: env("CHIRP_ASSET_STORE_PATH")
                .map(PathBuf::from)
                .or(file.asset_store_path)
                .unwrap_or(defaults.asset_store_path),
            asset_base_url: env("CHIRP_ASSET_BASE_URL")
                .or(file.asset_base_url)
                .unwrap_or(defaults.asset_base_url),
            classifier_url: env("CHIRP_CLASSIFIER_URL")
                .or(file.classifier_url)
                .unwrap_or(defaults.classifier_url),
            classifier_deadline: classifier_deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.classifier_deadline),
            generator_url: env("CHIRP_GENERATOR_URL")
                .or(file.generator_url)
                .unwrap_or(defaults.generator_url),
            generator_deadline: generator_deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.generator_deadline),
            inference_attempts: parsed("CHIRP_INFERENCE_ATTEMPTS", env("CHIRP_INFERENCE_ATTEMPTS"))?
                .or(file.inference_attempts)
                .unwrap_or(defaults.inference_attempts)
                .max(1),
            worker_pool_size,
            queue_capacity,
            job_deadline: job_deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_deadline),
            max_upload_bytes: parsed("CHIRP_MAX_UPLOAD_BYTES", env("CHIRP_MAX_UPLOAD_BYTES"))?
                .or(file.max_upload_bytes)
                .unwrap_or(defaults.max_upload_bytes),
            rate_limit_per_minute: parsed("CHIRP_RATE_LIMIT_PER_MINUTE", env("CHIRP_RATE_LIMIT_PER_MINUTE"))?
                .or(file.rate_limit_per_minute)
                .unwrap_or(defaults.rate_limit_per_minute)
                .max(1),
            rate_limit_burst: parsed("CHIRP_RATE_LIMIT_BURST", env("CHIRP_RATE_LIMIT_BURST"))?
                .or(file.rate_limit_burst)
                .unwrap_or(defaults.rate_limit_burst)
                .max(1),
            reaper_interval: reaper_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            reaper_max_age: reaper_max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_max_age),
            ws_ping_interval: ws_ping_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.ws_ping_interval),
            event_buffer: parsed("CHIRP_EVENT_BUFFER", env("CHIRP_EVENT_BUFFER"))?
                .or(file.event_buffer)
                .unwrap_or(defaults.event_buffer)
                .max(1),
        })
    }
}
