//! Configuration management for the Botica vault
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and environment variables. The encryption key is never
//! part of the configuration; only the name of its source is.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aggregate::Period;
use crate::error::{ConfigError, ConfigResult};
use crate::extract::Delimiter;

/// Default environment variable holding the hex-encoded key
pub const DEFAULT_KEY_ENV: &str = "BOTICA_ENCRYPTION_KEY";

/// Main configuration structure for the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Sealed storage configuration
    pub storage: StorageConfig,

    /// Key source configuration
    pub key: KeyConfig,

    /// Extraction configuration
    pub extraction: ExtractionConfig,

    /// Business rule configuration
    pub transform: TransformConfig,

    /// Aggregation configuration
    pub aggregation: AggregationConfig,

    /// Orchestration configuration
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Sealed storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding sealed dataset files
    pub sealed_dir: PathBuf,

    /// File extension of sealed files (without the dot)
    pub extension: String,
}

/// Key source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Environment variable holding the hex-encoded key
    pub env_var: String,

    /// Secret file holding the hex-encoded key; takes precedence over `env_var`
    pub secret_file: Option<PathBuf>,
}

/// Extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Field delimiter
    pub delimiter: Delimiter,

    /// Preamble lines before the header row
    pub skip_rows: usize,

    /// Accept rows with zero quantity instead of quarantining them
    pub allow_zero_quantity: bool,

    /// Product descriptions that mark system placeholder rows
    pub placeholder_products: Vec<String>,

    /// Per-dataset delimiter overrides
    pub dataset_delimiters: BTreeMap<String, Delimiter>,
}

/// Business rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Cumulative revenue share closing class A (0.0-1.0)
    pub abc_a_share: f64,

    /// Cumulative revenue share closing class B (0.0-1.0)
    pub abc_b_share: f64,

    /// Upper bounds of the Low, Medium, High and Premium price bands
    pub price_band_limits: [f64; 4],

    /// Upper bounds of the None, Low and Medium rotation bands (units sold)
    pub rotation_limits: [f64; 3],

    /// Upper bounds of the Out, Low and Medium stock levels
    pub stock_limits: [f64; 3],
}

/// Aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Calendar bucket of the revenue time series
    pub period: Period,

    /// Length of each ranking
    pub top_n: usize,
}

/// Orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Datasets processed concurrently
    pub max_workers: usize,

    /// Rows extracted between cancellation checks
    pub cancel_check_rows: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format ("text" or "json")
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let sealed_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("botica")
            .join("encrypted");

        Self {
            sealed_dir,
            extension: "enc".to_string(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            env_var: DEFAULT_KEY_ENV.to_string(),
            secret_file: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Auto,
            skip_rows: 0,
            allow_zero_quantity: false,
            placeholder_products: vec!["zzzz".to_string()],
            dataset_delimiters: BTreeMap::new(),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            abc_a_share: 0.80,
            abc_b_share: 0.95,
            price_band_limits: [5_000.0, 10_000.0, 20_000.0, 50_000.0],
            rotation_limits: [0.0, 1.0, 5.0],
            stock_limits: [0.0, 5.0, 20.0],
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            period: Period::Month,
            top_n: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cancel_check_rows: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ExtractionConfig {
    /// Delimiter to use for a dataset, honouring per-dataset overrides
    pub fn delimiter_for(&self, dataset_id: &str) -> Delimiter {
        self.dataset_delimiters
            .get(dataset_id)
            .copied()
            .unwrap_or(self.delimiter)
    }
}

impl VaultConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: VaultConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = VaultConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `BOTICA_*` environment variables
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Ok(sealed_dir) = std::env::var("BOTICA_SEALED_DIR") {
            self.storage.sealed_dir = PathBuf::from(sealed_dir);
        }

        if let Ok(env_var) = std::env::var("BOTICA_KEY_ENV") {
            self.key.env_var = env_var;
        }

        if let Ok(secret_file) = std::env::var("BOTICA_KEY_FILE") {
            self.key.secret_file = Some(PathBuf::from(secret_file));
        }

        if let Ok(skip_rows) = std::env::var("BOTICA_SKIP_ROWS") {
            self.extraction.skip_rows = skip_rows.parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "BOTICA_SKIP_ROWS".to_string(),
                    value: skip_rows,
                })?;
        }

        if let Ok(max_workers) = std::env::var("BOTICA_MAX_WORKERS") {
            self.pipeline.max_workers = max_workers.parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "BOTICA_MAX_WORKERS".to_string(),
                    value: max_workers,
                })?;
        }

        if let Ok(log_level) = std::env::var("BOTICA_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = VaultConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = VaultConfig::from_file(path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let extension = &self.storage.extension;
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) || extension == "tmp" {
            return Err(ConfigError::InvalidValue {
                field: "storage.extension".to_string(),
                value: extension.clone(),
            });
        }

        if self.key.env_var.trim().is_empty() && self.key.secret_file.is_none() {
            return Err(ConfigError::ValidationFailed {
                reason: "no key source configured".to_string(),
            });
        }

        let transform = &self.transform;
        if !(transform.abc_a_share > 0.0 && transform.abc_a_share < transform.abc_b_share && transform.abc_b_share <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "transform.abc_a_share/abc_b_share".to_string(),
                value: format!("{}/{}", transform.abc_a_share, transform.abc_b_share),
            });
        }

        check_increasing("transform.price_band_limits", &transform.price_band_limits)?;
        check_increasing("transform.rotation_limits", &transform.rotation_limits)?;
        check_increasing("transform.stock_limits", &transform.stock_limits)?;

        if self.aggregation.top_n == 0 {
            return Err(ConfigError::InvalidValue {
                field: "aggregation.top_n".to_string(),
                value: "0".to_string(),
            });
        }

        if self.pipeline.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.max_workers".to_string(),
                value: "0".to_string(),
            });
        }

        if self.pipeline.cancel_check_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.cancel_check_rows".to_string(),
                value: "0".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                value: self.logging.format.clone(),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("botica").join("vault.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string()
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|_| ConfigError::ValidationFailed {
                    reason: format!("Unable to create config directory: {}", parent.display())
                })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|_| ConfigError::PermissionDenied { path: path.to_string_lossy().to_string() })?;

        Ok(())
    }
}

fn check_increasing(field: &str, limits: &[f64]) -> ConfigResult<()> {
    let increasing = limits.iter().all(|v| v.is_finite())
        && limits.windows(2).all(|pair| pair[0] < pair[1]);

    if increasing {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", limits),
        })
    }
}
