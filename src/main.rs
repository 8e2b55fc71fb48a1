/*!
 * Sluice CLI - Command Line Interface
 *
 * `sluice check` validates a gate configuration and prints the effective
 * settings. `sluice simulate` drives synthetic traffic through a gate built
 * from that configuration and reports what was admitted, rejected and shed.
 */

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sluice::{
    config::{LogLevel, SluiceConfig},
    error::{SluiceError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    simulate::{self, SimulationParams},
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Admission control, circuit breaking and priority scheduling for request traffic", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    Check {
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: PathBuf,
    },

    /// Run a synthetic workload through a gate
    Simulate {
        /// Configuration file (defaults are used when omitted)
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: Option<PathBuf>,

        /// Number of requests to submit
        #[arg(short = 'n', long = "requests", default_value_t = 1_000)]
        requests: u64,

        /// Probability that a downstream call fails
        #[arg(long = "failure-rate", default_value_t = 0.05)]
        failure_rate: f64,

        /// Mean downstream latency in milliseconds
        #[arg(long = "latency-ms", default_value_t = 2)]
        latency_ms: u64,

        /// Distinct admission keys
        #[arg(long = "keys", default_value_t = 8)]
        keys: usize,

        /// Microseconds between submissions
        #[arg(long = "interarrival-us", default_value_t = 500)]
        interarrival_us: u64,

        /// Random seed for traffic and failures
        #[arg(long = "seed", default_value_t = 0x5eed)]
        seed: u64,

        /// Print the report as JSON
        #[arg(long = "json")]
        json: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<SluiceError>()
                .map(SluiceError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Check { config } => Some(config.as_path()),
        Commands::Simulate { config, .. } => config.as_deref(),
    };
    let mut config = load_config(config_path)?;

    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Check { config: path } => check(&path, &config),
        Commands::Simulate {
            requests,
            failure_rate,
            latency_ms,
            keys,
            interarrival_us,
            seed,
            json,
            ..
        } => {
            let params = SimulationParams {
                requests,
                failure_rate,
                latency: Duration::from_millis(latency_ms),
                keys,
                interarrival: Duration::from_micros(interarrival_us),
                seed,
            };
            run_simulation(&config, &params, json)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SluiceConfig> {
    let config = match path {
        Some(path) => SluiceConfig::from_file(path)?,
        None => SluiceConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn check(path: &Path, config: &SluiceConfig) -> anyhow::Result<()> {
    println!("Configuration {} is valid\n", path.display());
    let scheduler = config.scheduler.scheduler();
    if !scheduler.thresholds_are_monotonic() {
        println!("Note: shed thresholds are not monotonic across priority classes\n");
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn run_simulation(
    config: &SluiceConfig,
    params: &SimulationParams,
    json: bool,
) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&params.failure_rate) {
        anyhow::bail!("--failure-rate must be between 0 and 1");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let report = runtime.block_on(simulate::run(config, params))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.summary());
    }
    Ok(())
}
