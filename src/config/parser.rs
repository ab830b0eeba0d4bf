//! Configuration file parser
//!
//! Parses `key value` configuration files for the sandbox.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use super::SandboxConfig;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),
}

/// Parse a configuration file
pub fn parse_config_file(path: &Path) -> Result<SandboxConfig, ConfigParseError> {
    let contents = fs::read_to_string(path)?;
    parse_config_str(&contents)
}

/// Parse configuration text, starting from the defaults
pub fn parse_config_str(contents: &str) -> Result<SandboxConfig, ConfigParseError> {
    let mut config = SandboxConfig::default();

    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            return Err(ConfigParseError::Format(line_num + 1, line.to_string()));
        }

        let param = parts[0].trim().to_lowercase();
        let value = parts[1].trim();
        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

/// Apply a configuration parameter to the config
fn apply_config_param(
    config: &mut SandboxConfig,
    param: &str,
    value: &str,
    line_num: usize,
) -> Result<(), ConfigParseError> {
    match param {
        "memory-limit" => {
            config.memory_limit = parse_size(param, value, line_num)? as usize;
        }
        "cpu-limit" => {
            config.cpu_limit = parse_seconds(param, value, line_num)?;
        }
        "emergency-cpu-limit" => {
            config.emergency_cpu_limit = parse_seconds(param, value, line_num)?;
        }
        "hook-interval" => {
            config.hook_interval = parse_value(param, value, line_num)?;
        }
        "max-conversion-depth" => {
            config.max_conversion_depth = parse_value(param, value, line_num)?;
        }
        "random-seed" => {
            config.random_seed = parse_value(param, value, line_num)?;
        }
        "allow-global" => {
            config.allowed_globals.insert(parse_name(param, value, line_num)?);
        }
        "deny-global" => {
            config.allowed_globals.remove(&parse_name(param, value, line_num)?);
        }
        "profiler-period" => {
            config.profiler_period = parse_seconds(param, value, line_num)?;
        }
        _ => {
            warn!(param, line = line_num, "unknown configuration parameter, skipping");
        }
    }

    Ok(())
}

/// Parse a value that implements FromStr
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a global name; a single identifier
fn parse_name(param: &str, value: &str, line_num: usize) -> Result<String, ConfigParseError> {
    let valid = value
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string()));
    }
    Ok(value.to_string())
}

/// Parse a number of seconds (e.g., 2, 0.25); zero means none
pub(crate) fn parse_seconds(param: &str, value: &str, line_num: usize) -> Result<Option<Duration>, ConfigParseError> {
    let seconds: f64 = parse_value(param, value, line_num)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string()));
    }
    if seconds == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a size value (e.g., 64mb, 2gb)
pub(crate) fn parse_size(param: &str, value: &str, line_num: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim().to_lowercase();

    // Find the end of the numeric part
    let idx = value.chars().take_while(|c| c.is_ascii_digit()).count();
    if idx == 0 {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value.clone()));
    }
    let num: u64 = value[..idx]
        .parse()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.clone()))?;

    let multiplier: u64 = match &value[idx..] {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(ConfigParseError::Value(param.to_string(), line_num, value)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigParseError::Value(param.to_string(), line_num, value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_basic_config() {
        let config_content = r#"
# Limits
memory-limit 8mb
cpu-limit 0.5
emergency-cpu-limit 2

# Environment
random-seed 42
deny-global os
allow-global load
hook-interval 500
"#;

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        write(path, config_content).unwrap();

        let config = parse_config_file(path).unwrap();

        assert_eq!(config.memory_limit, 8 * 1024 * 1024);
        assert_eq!(config.cpu_limit, Some(Duration::from_millis(500)));
        assert_eq!(config.emergency_cpu_limit, Some(Duration::from_secs(2)));
        assert_eq!(config.random_seed, 42);
        assert_eq!(config.hook_interval, 500);
        assert!(!config.allowed_globals.contains("os"));
        assert!(config.allowed_globals.contains("load"));
    }

    #[test]
    fn test_unknown_parameter_is_skipped() {
        let config = parse_config_str("colour blue\nrandom-seed 7\n").unwrap();
        assert_eq!(config.random_seed, 7);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        match parse_config_str("# comment\n\ncpu-limit soon\n") {
            Err(ConfigParseError::Value(param, line, _)) => {
                assert_eq!(param, "cpu-limit");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            parse_config_str("memory-limit\n"),
            Err(ConfigParseError::Format(1, _))
        ));
        assert!(parse_config_str("allow-global os.execute\n").is_err());
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("test", "0", 1).unwrap(), None);
        assert_eq!(parse_seconds("test", "1.25", 1).unwrap(), Some(Duration::from_millis(1250)));
        assert!(parse_seconds("test", "-1", 1).is_err());
        assert!(parse_seconds("test", "inf", 1).is_err());
        assert!(parse_seconds("test", "1e30", 1).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("test", "1024", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1kb", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1mb", 1).unwrap(), 1024 * 1024);
        assert_eq!(parse_size("test", "1gb", 1).unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("test", "invalid", 1).is_err());
        assert!(parse_size("test", "99999999999999999999gb", 1).is_err());
    }
}
