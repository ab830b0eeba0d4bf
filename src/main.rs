//! luasandbox - run a Lua script under CPU and memory limits
//!
//! This is the entry point for the command-line runner.

use std::fs;
use std::process;

use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use luasandbox::config::{self, parse_args, CliArgs, ConfigError};
use luasandbox::lua::{ErrorKind, HostValue, LuaSandbox, ProfilerUnits};
use luasandbox::{SandboxConfig, SandboxError};

/// Failures of the runner itself, as opposed to the guest
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),
}

impl RunError {
    fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => 1,
            RunError::Sandbox(err) => match err.kind() {
                Some(ErrorKind::Timeout) => 124,
                Some(ErrorKind::EmergencyTimeout) => 125,
                Some(kind) => kind.code(),
                None => 1,
            },
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            config::print_help();
            process::exit(1);
        }
    };
    if args.help {
        config::print_help();
        return;
    }
    if args.version {
        println!("luasandbox {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run(args) {
        match &e {
            RunError::Sandbox(SandboxError::Guest(record)) => {
                eprintln!("Error: {}", record);
                if !record.trace.is_empty() {
                    eprintln!("{}", record.traceback());
                }
            }
            _ => eprintln!("Error: {}", e),
        }
        process::exit(e.exit_code());
    }
}

fn run(args: CliArgs) -> Result<(), RunError> {
    let mut config = match &args.config {
        Some(path) => SandboxConfig::from_file(path).map_err(ConfigError::from)?,
        None => SandboxConfig::default(),
    };
    config.apply_cli_args(&args);
    config.validate()?;

    let (code, chunk_name) = match (&args.code, &args.script) {
        (Some(code), _) => (code.clone().into_bytes(), "=(command line)".to_string()),
        (None, Some(path)) => (
            fs::read(path).map_err(ConfigError::from)?,
            format!("@{}", path.display()),
        ),
        (None, None) => {
            return Err(ConfigError::Other("no script given (use -e or a file name)".to_string()).into())
        }
    };

    let sandbox = LuaSandbox::with_config(config)?;
    info!(sandbox = %sandbox.id(), chunk = %chunk_name, "running script");

    let main = sandbox.load(&code, &chunk_name, args.binary)?;
    if let Some(path) = &args.dump {
        fs::write(path, main.serialize()?).map_err(ConfigError::from)?;
        debug!(path = %path.display(), "compiled chunk written");
    }

    let script_args: Vec<HostValue> = args.script_args.iter().map(|arg| HostValue::from(arg.as_str())).collect();
    print_values(&main.call(&script_args)?);

    if let Some(name) = &args.call {
        print_values(&sandbox.call_function(name, &[])?);
    }

    if sandbox.config().profiler_period.is_some() {
        sandbox.disable_profiler()?;
        let percent = sandbox.profiler_function_report(ProfilerUnits::Percent);
        let samples = sandbox.profiler_function_report(ProfilerUnits::Samples);
        eprintln!("{:>8} {:>7}  function", "samples", "%");
        for ((name, count), (_, share)) in samples.iter().zip(percent.iter()) {
            eprintln!("{:>8} {:>6.2}%  {}", count, share, name);
        }
    }

    if args.verbose {
        let budget = sandbox.budget();
        eprintln!("cpu: {:.6}s", budget.cpu_used.as_secs_f64());
        eprintln!("memory: {} bytes (peak {} bytes)", budget.current_memory, budget.peak_memory);
    }

    Ok(())
}

fn print_values(values: &[HostValue]) {
    for value in values {
        println!("{}", value);
    }
}
