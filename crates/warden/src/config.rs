//! Configuration management for Warden.

use anyhow::{Context, Result, anyhow};
use beian_common::GeometryPreset;
use beian_common::constants::{
    DEFAULT_ACQUISITION_ATTEMPTS, DEFAULT_API_BASE_URL, DEFAULT_LISTEN_ADDR,
    DEFAULT_REPLENISH_FLOOR, DEFAULT_REPLENISH_INTERVAL_SECS, DEFAULT_REPLENISH_JOIN_TIMEOUT_SECS,
    DEFAULT_REPLENISH_TTL_SECS, DEFAULT_RESULT_TTL_SECS, DEFAULT_SERVE_TTL_SECS,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Redis URL for the result cache (in-memory cache if unset)
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub solver: SolverConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub replenisher: ReplenisherConfig,

    #[serde(default)]
    pub result_cache: ResultCacheConfig,
}

/// Remote API client settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Per-request timeout; transport default if unset
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            accept_invalid_certs: false,
            request_timeout_secs: None,
        }
    }
}

/// Perception model settings
#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_detector_model")]
    pub detector_model: PathBuf,

    #[serde(default = "default_siamese_model")]
    pub siamese_model: PathBuf,

    /// Font for text targets
    #[serde(default = "default_font_path")]
    pub font_path: PathBuf,

    #[serde(default)]
    pub geometry: GeometryPreset,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            detector_model: default_detector_model(),
            siamese_model: default_siamese_model(),
            font_path: default_font_path(),
            geometry: GeometryPreset::default(),
        }
    }
}

/// Credential snapshot settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// TTL when serving consumer reads
    #[serde(default = "default_serve_ttl")]
    pub serve_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            serve_ttl_secs: default_serve_ttl(),
        }
    }
}

/// Caller-level acquisition policy
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
        }
    }
}

/// Background replenishment settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReplenisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_replenish_interval")]
    pub interval_secs: f64,

    /// TTL for the floor check
    #[serde(default = "default_replenish_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_replenish_floor")]
    pub floor: usize,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

impl Default for ReplenisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_replenish_interval(),
            ttl_secs: default_replenish_ttl(),
            floor: default_replenish_floor(),
            attempts: default_attempts(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

impl ReplenisherConfig {
    /// Tick interval. Negative, zero, NaN and out-of-range values are rejected.
    pub fn interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.interval_secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| {
                anyhow!(
                    "replenisher.interval_secs must be a positive number of seconds, got {}",
                    self.interval_secs
                )
            })
    }
}

/// Query result cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct ResultCacheConfig {
    #[serde(default = "default_result_ttl")]
    pub ttl_secs: u64,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_result_ttl(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_api_base_url() -> String { DEFAULT_API_BASE_URL.to_string() }
fn default_detector_model() -> PathBuf { PathBuf::from("models/best.onnx") }
fn default_siamese_model() -> PathBuf { PathBuf::from("models/siamese.onnx") }
fn default_font_path() -> PathBuf { PathBuf::from("assets/fonts/STHeiti Medium.ttc") }
fn default_store_path() -> PathBuf { expand_home("~/.beian-warden/cache/token_cache.json") }
fn default_serve_ttl() -> u64 { DEFAULT_SERVE_TTL_SECS }
fn default_attempts() -> u32 { DEFAULT_ACQUISITION_ATTEMPTS }
fn default_true() -> bool { true }
fn default_replenish_interval() -> f64 { DEFAULT_REPLENISH_INTERVAL_SECS as f64 }
fn default_replenish_ttl() -> u64 { DEFAULT_REPLENISH_TTL_SECS }
fn default_replenish_floor() -> usize { DEFAULT_REPLENISH_FLOOR }
fn default_join_timeout() -> u64 { DEFAULT_REPLENISH_JOIN_TIMEOUT_SECS }
fn default_result_ttl() -> u64 { DEFAULT_RESULT_TTL_SECS }

/// Resolve a leading `~/` against `$HOME`
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = Self::from_file(config_path)?;

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = Some(redis_url.clone());
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if args.no_replenisher {
            config.replenisher.enabled = false;
        }

        Ok(config)
    }

    fn from_file(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            // Use defaults if config file doesn't exist
            tracing::warn!(path = config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
            .context("Failed to load config file")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;
        if let Some(path) = config.store.path.to_str() {
            config.store.path = expand_home(path);
        }
        config.replenisher.interval()?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            redis_url: None,
            api: ApiConfig::default(),
            solver: SolverConfig::default(),
            store: StoreConfig::default(),
            acquisition: AcquisitionConfig::default(),
            replenisher: ReplenisherConfig::default(),
            result_cache: ResultCacheConfig::default(),
        }
    }
}
