//! Harness configuration: defaults, then environment, then CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_OUTPUT_DIR: &str = "llm_data";
pub const DEFAULT_MODELS_PATH: &str = "models.csv";
pub const DEFAULT_SURVEYS_DIR: &str = "surveys";
pub const DEFAULT_MIN_ITERATIONS: u32 = 100;
pub const DEFAULT_SEED: u64 = 1;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub output_dir: PathBuf,
    pub models_path: PathBuf,
    pub surveys_dir: PathBuf,
    /// Target completions per (provider, model, survey).
    pub min_iterations: u32,
    pub seed: u64,
    /// Pause after each successful or rejected attempt.
    pub cooldown: Duration,
    pub max_retries: u32,
    /// Per-request timeout for provider HTTP calls.
    pub http_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            models_path: PathBuf::from(DEFAULT_MODELS_PATH),
            surveys_dir: PathBuf::from(DEFAULT_SURVEYS_DIR),
            min_iterations: DEFAULT_MIN_ITERATIONS,
            seed: DEFAULT_SEED,
            cooldown: DEFAULT_COOLDOWN,
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `MINIPUBLIC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("MINIPUBLIC_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MINIPUBLIC_MODELS") {
            config.models_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MINIPUBLIC_SURVEYS") {
            config.surveys_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MINIPUBLIC_MIN_ITERATIONS") {
            config.min_iterations = parse_var("MINIPUBLIC_MIN_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("MINIPUBLIC_SEED") {
            config.seed = parse_var("MINIPUBLIC_SEED", &v)?;
        }
        if let Some(v) = lookup("MINIPUBLIC_COOLDOWN_MS") {
            config.cooldown = Duration::from_millis(parse_var("MINIPUBLIC_COOLDOWN_MS", &v)?);
        }
        if let Some(v) = lookup("MINIPUBLIC_MAX_RETRIES") {
            config.max_retries = parse_var("MINIPUBLIC_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MINIPUBLIC_HTTP_TIMEOUT_SECONDS") {
            config.http_timeout =
                Duration::from_secs(parse_var("MINIPUBLIC_HTTP_TIMEOUT_SECONDS", &v)?);
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
