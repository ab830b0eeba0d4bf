//! Configuration module
//!
//! Sandbox settings come from defaults, an optional configuration file and
//! command-line overrides, applied in that order.

mod cli;
mod parser;

pub use cli::{parse_args, print_help, CliArgs, CliError};
pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::lua::DEFAULT_ALLOWED_GLOBALS;

/// Settings for one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Memory ceiling in bytes (0 = unlimited)
    pub memory_limit: usize,

    /// Normal CPU limit; a catchable-by-host timeout once exceeded
    pub cpu_limit: Option<Duration>,

    /// Emergency CPU limit, reported when the normal limit could not be
    /// delivered in time
    pub emergency_cpu_limit: Option<Duration>,

    /// VM instructions between safe-point checks
    pub hook_interval: u32,

    /// Deepest nesting the marshaller will follow
    pub max_conversion_depth: usize,

    /// Seed for the guest's `math.random`
    pub random_seed: u64,

    /// Globals visible to guest code
    pub allowed_globals: BTreeSet<String>,

    /// Start the profiler with this sample period
    pub profiler_period: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            memory_limit: 0,
            cpu_limit: None,
            emergency_cpu_limit: None,
            hook_interval: 1000,
            max_conversion_depth: 256,
            random_seed: 0,
            allowed_globals: DEFAULT_ALLOWED_GLOBALS.iter().map(|name| name.to_string()).collect(),
            profiler_period: None,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigParseError> {
        let path = path.into();
        parse_config_file(&path)
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hook_interval == 0 {
            return Err(ConfigError::Other("hook-interval must be positive".to_string()));
        }
        if self.max_conversion_depth == 0 {
            return Err(ConfigError::Other("max-conversion-depth must be positive".to_string()));
        }
        let normal = self.cpu_limit.filter(|limit| !limit.is_zero());
        let emergency = self.emergency_cpu_limit.filter(|limit| !limit.is_zero());
        if let (Some(normal), Some(emergency)) = (normal, emergency) {
            if emergency < normal {
                return Err(ConfigError::Other(format!(
                    "emergency-cpu-limit ({}) is lower than cpu-limit ({})",
                    format_seconds(Some(emergency)),
                    format_seconds(Some(normal))
                )));
            }
        }
        Ok(())
    }

    /// Apply command-line arguments to override config
    pub fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(limit) = args.memory_limit {
            self.memory_limit = limit;
        }
        if let Some(limit) = args.cpu_limit {
            self.cpu_limit = Some(limit).filter(|limit| !limit.is_zero());
        }
        if let Some(limit) = args.emergency_cpu_limit {
            self.emergency_cpu_limit = Some(limit).filter(|limit| !limit.is_zero());
        }
        if let Some(period) = args.profile {
            self.profiler_period = Some(period).filter(|period| !period.is_zero());
        }
    }

    /// Get a configuration parameter by name
    pub fn get(&self, param: &str) -> Option<String> {
        match param {
            "memory-limit" => Some(self.memory_limit.to_string()),
            "cpu-limit" => Some(format_seconds(self.cpu_limit)),
            "emergency-cpu-limit" => Some(format_seconds(self.emergency_cpu_limit)),
            "hook-interval" => Some(self.hook_interval.to_string()),
            "max-conversion-depth" => Some(self.max_conversion_depth.to_string()),
            "random-seed" => Some(self.random_seed.to_string()),
            "allowed-globals" => Some(self.allowed_globals_str()),
            "profiler-period" => Some(format_seconds(self.profiler_period)),
            _ => None,
        }
    }

    /// Get all configuration parameters
    pub fn get_all(&self) -> Vec<(String, String)> {
        [
            "memory-limit",
            "cpu-limit",
            "emergency-cpu-limit",
            "hook-interval",
            "max-conversion-depth",
            "random-seed",
            "allowed-globals",
            "profiler-period",
        ]
        .iter()
        .filter_map(|param| self.get(param).map(|value| (param.to_string(), value)))
        .collect()
    }

    fn allowed_globals_str(&self) -> String {
        self.allowed_globals
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Seconds with up to microsecond precision, `0` for no limit
fn format_seconds(duration: Option<Duration>) -> String {
    match duration {
        None => "0".to_string(),
        Some(duration) => {
            let text = format!("{:.6}", duration.as_secs_f64());
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    }
}

/// Errors that can occur during configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file parse error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] ConfigParseError),

    /// Command-line error
    #[error("{0}")]
    Cli(#[from] CliError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Configuration error: {0}")]
    Other(String),
}
