//! Command-line argument parser
//!
//! Parses command-line arguments for the `luasandbox` runner.

use std::path::PathBuf;
use std::time::Duration;

use super::parser::{parse_seconds, parse_size};

/// Command-line arguments for the runner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    /// Configuration file path
    pub config: Option<PathBuf>,

    /// Inline code to run instead of a script file
    pub code: Option<String>,

    /// Load the script as a precompiled chunk
    pub binary: bool,

    /// Global function to call after the script has run
    pub call: Option<String>,

    /// Memory limit override in bytes
    pub memory_limit: Option<usize>,

    /// Normal CPU limit override; zero disables the limit
    pub cpu_limit: Option<Duration>,

    /// Emergency CPU limit override; zero disables the limit
    pub emergency_cpu_limit: Option<Duration>,

    /// Profiler sample period
    pub profile: Option<Duration>,

    /// Write the compiled main chunk to this file
    pub dump: Option<PathBuf>,

    /// Report usage after the run
    pub verbose: bool,

    pub help: bool,
    pub version: bool,

    /// Script file to run
    pub script: Option<PathBuf>,

    /// Arguments passed to the script
    pub script_args: Vec<String>,
}

/// Errors from command-line parsing
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CliError {
    #[error("Missing argument for {0}")]
    MissingValue(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),
}

/// Parse command-line arguments, program name excluded
pub fn parse_args<I, S>(args: I) -> Result<CliArgs, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let mut cli_args = CliArgs::default();
    let mut i = 0;

    let value_of = |i: usize, flag: &str| -> Result<String, CliError> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| CliError::MissingValue(flag.to_string()))
    };
    let invalid = |flag: &str, value: &str| CliError::InvalidValue(flag.to_string(), value.to_string());

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                cli_args.help = true;
                i += 1;
            }
            "--version" | "-v" => {
                cli_args.version = true;
                i += 1;
            }
            "--config" | "-c" => {
                cli_args.config = Some(PathBuf::from(value_of(i, arg)?));
                i += 2;
            }
            "-e" => {
                cli_args.code = Some(value_of(i, arg)?);
                i += 2;
            }
            "--binary" => {
                cli_args.binary = true;
                i += 1;
            }
            "--call" => {
                cli_args.call = Some(value_of(i, arg)?);
                i += 2;
            }
            "--memory-limit" => {
                let value = value_of(i, arg)?;
                let bytes = parse_size(arg, &value, 0).map_err(|_| invalid(arg, &value))?;
                cli_args.memory_limit = Some(usize::try_from(bytes).map_err(|_| invalid(arg, &value))?);
                i += 2;
            }
            "--cpu-limit" | "--emergency-cpu-limit" | "--profile" => {
                let value = value_of(i, arg)?;
                let seconds = parse_seconds(arg, &value, 0)
                    .map_err(|_| invalid(arg, &value))?
                    .unwrap_or(Duration::ZERO);
                match arg {
                    "--cpu-limit" => cli_args.cpu_limit = Some(seconds),
                    "--emergency-cpu-limit" => cli_args.emergency_cpu_limit = Some(seconds),
                    _ => cli_args.profile = Some(seconds),
                }
                i += 2;
            }
            "--dump" => {
                cli_args.dump = Some(PathBuf::from(value_of(i, arg)?));
                i += 2;
            }
            "--verbose" => {
                cli_args.verbose = true;
                i += 1;
            }
            "--" => {
                i += 1;
                if cli_args.script.is_none() && cli_args.code.is_none() && i < args.len() {
                    cli_args.script = Some(PathBuf::from(&args[i]));
                    i += 1;
                }
                cli_args.script_args.extend(args[i..].iter().cloned());
                break;
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(CliError::UnknownArgument(arg.to_string()));
            }
            _ => {
                // Everything after the script (or after -e code) belongs to the script
                if cli_args.code.is_none() {
                    cli_args.script = Some(PathBuf::from(arg));
                    i += 1;
                }
                cli_args.script_args.extend(args[i..].iter().cloned());
                break;
            }
        }
    }

    Ok(cli_args)
}

/// Print help information
pub fn print_help() {
    println!("Usage: luasandbox [OPTIONS] <script.lua> [ARGS...]");
    println!("       luasandbox [OPTIONS] -e <code> [ARGS...]");
    println!();
    println!("Options:");
    println!("  --help, -h                    Show this help message");
    println!("  --version, -v                 Show version information");
    println!("  --config, -c <file>           Configuration file to use");
    println!("  -e <code>                     Run <code> instead of a script file");
    println!("  --binary                      Script is a precompiled chunk");
    println!("  --call <name>                 Call global function <name> after the script");
    println!("  --memory-limit <size>         Memory limit (e.g. 32mb, 0 = unlimited)");
    println!("  --cpu-limit <secs>            Normal CPU limit (0 = none)");
    println!("  --emergency-cpu-limit <secs>  Emergency CPU limit (0 = none)");
    println!("  --profile <secs>              Profile with the given sample period");
    println!("  --dump <file>                 Write the compiled script to <file>");
    println!("  --verbose                     Report CPU and memory usage");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_and_arguments() {
        let args = parse_args(["--cpu-limit", "0.5", "script.lua", "a", "--b"]).unwrap();
        assert_eq!(args.cpu_limit, Some(Duration::from_millis(500)));
        assert_eq!(args.script, Some(PathBuf::from("script.lua")));
        assert_eq!(args.script_args, vec!["a".to_string(), "--b".to_string()]);
    }

    #[test]
    fn test_inline_code() {
        let args = parse_args(["-e", "return 1", "--call", "main", "x"]).unwrap();
        assert_eq!(args.code.as_deref(), Some("return 1"));
        assert_eq!(args.call.as_deref(), Some("main"));
        assert_eq!(args.script, None);
        assert_eq!(args.script_args, vec!["x".to_string()]);
    }

    #[test]
    fn test_limits() {
        let args = parse_args(["--memory-limit", "2mb", "--emergency-cpu-limit", "0"]).unwrap();
        assert_eq!(args.memory_limit, Some(2 * 1024 * 1024));
        assert_eq!(args.emergency_cpu_limit, Some(Duration::ZERO));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse_args(["--config"]),
            Err(CliError::MissingValue("--config".to_string()))
        );
        assert!(matches!(
            parse_args(["--cpu-limit", "soon"]),
            Err(CliError::InvalidValue(_, _))
        ));
        assert_eq!(
            parse_args(["--frobnicate"]),
            Err(CliError::UnknownArgument("--frobnicate".to_string()))
        );
    }

    #[test]
    fn test_flags() {
        let args = parse_args(["--help", "--verbose", "--binary"]).unwrap();
        assert!(args.help && args.verbose && args.binary);
        assert!(!args.version);
    }
}
