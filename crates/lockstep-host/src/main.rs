//! Lockstep host entry point.
//!
//! Builds a clock from configuration, installs the demo machine, and runs it
//! in batches until the requested cycle count is reached or a stop signal
//! arrives. The clock is always disposed before the summary is reported.

mod diagnostics;
mod machine;
mod signals;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lockstep_common::config::{ClockConfig, StrategyKind};
use lockstep_runtime::Clock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::diagnostics::RunSummary;
use crate::machine::{schedule_vblank, Bus, MachineLayout};
use crate::signals::SignalHandler;

/// Cycles per `run` call; stop requests are honoured between batches.
const BATCH_CYCLES: u64 = 10_000;

/// Environment variable naming a configuration file.
const CONFIG_ENV: &str = "LOCKSTEP_CONFIG";

/// Configuration file used when nothing else is given.
const LOCAL_CONFIG: &str = "config/lockstep.toml";

/// Lockstep host command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "lockstep",
    about = "Run a demo machine of clocked chips in cycle lockstep",
    version,
    long_about = None
)]
struct Args {
    /// Path to a clock configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Synchronization strategy (overrides config file).
    #[arg(long, short = 's')]
    strategy: Option<StrategyKind>,

    /// Cycles to run (0 = until SIGINT/SIGTERM).
    #[arg(long, short = 'n', default_value_t = 1_000_000)]
    cycles: u64,

    /// Number of processors.
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Number of raster beams.
    #[arg(long, default_value_t = 1)]
    videos: usize,

    /// Number of interval timers.
    #[arg(long, default_value_t = 2)]
    timers: usize,

    /// Interval timer period in cycles.
    #[arg(long, default_value_t = 1_000)]
    timer_period: u64,

    /// Stall timeout, e.g. "2s" (overrides config file).
    #[arg(long, value_parser = humantime::parse_duration)]
    stall_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn layout(&self) -> MachineLayout {
        MachineLayout {
            cpus: self.cpus,
            videos: self.videos,
            timers: self.timers,
            timer_period: self.timer_period,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting lockstep host");

    let config = resolve_config(&args, load_config(&args)?)?;
    let layout = args.layout();
    if layout.component_count() == 0 {
        bail!("machine has no components; pass at least one of --cpus, --videos, --timers");
    }
    if layout.timer_period == 0 {
        bail!("--timer-period must be at least 1");
    }

    let signals = SignalHandler::install().context("Failed to install signal handlers")?;
    let summary = run_host(config, layout, args.cycles, &signals)?;

    if args.json {
        println!("{}", summary.to_json().context("Failed to render summary")?);
    }
    summary.log();

    if !summary.is_success() {
        bail!("run ended with {} fault(s)", summary.faults.len());
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = format!("lockstep_host={level},lockstep_runtime={level},lockstep_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// First match wins:
/// 1. `--config`
/// 2. `LOCKSTEP_CONFIG`
/// 3. `config/lockstep.toml`
/// 4. built-in defaults
fn load_config(args: &Args) -> Result<ClockConfig> {
    if let Some(path) = &args.config {
        info!(?path, "Loading config from command-line argument");
        return ClockConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            info!(?path, "Loading config from {CONFIG_ENV}");
            return ClockConfig::from_file(&path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(path = %env_path, "{CONFIG_ENV} set but file does not exist");
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        info!(path = ?local, "Loading config from local path");
        return ClockConfig::from_file(&local)
            .with_context(|| format!("Failed to load config from {LOCAL_CONFIG}"));
    }

    info!("No config file found, using built-in defaults");
    Ok(ClockConfig::default())
}

/// Apply command-line overrides on top of the loaded configuration.
fn resolve_config(args: &Args, mut config: ClockConfig) -> Result<ClockConfig> {
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(timeout) = args.stall_timeout {
        if timeout.is_zero() {
            bail!("--stall-timeout must be greater than zero");
        }
        config.stall_timeout = Some(timeout);
    }
    info!(
        strategy = %config.strategy,
        stall_timeout = ?config.stall_timeout,
        fault_policy = ?config.fault_policy,
        "Configuration resolved"
    );
    Ok(config)
}

/// Build the machine, run it, and dispose the clock.
fn run_host(
    config: ClockConfig,
    layout: MachineLayout,
    cycles: u64,
    signals: &SignalHandler,
) -> Result<RunSummary> {
    let mut clock = Clock::new(config);
    let bus = Arc::new(Bus::default());
    layout
        .install(&mut clock, &bus)
        .context("Failed to install machine")?;
    schedule_vblank(&clock, Arc::clone(&bus)).context("Failed to schedule vertical blank")?;

    info!(
        strategy = clock.strategy_name(),
        components = layout.component_count(),
        cycles,
        "Machine ready"
    );

    let started = Instant::now();
    let mut interrupted = false;
    let mut remaining = cycles;
    loop {
        if signals.stop_requested() {
            info!(cycle = clock.current_cycle(), "Stop requested, ending run");
            interrupted = true;
            break;
        }
        if signals.take_status_request() {
            info!(
                cycle = clock.current_cycle(),
                elapsed = %humantime::format_duration(Duration::from_millis(
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
                )),
                "Progress"
            );
        }

        let batch = if cycles == 0 {
            BATCH_CYCLES
        } else {
            remaining.min(BATCH_CYCLES)
        };
        if batch == 0 {
            break;
        }
        if let Err(e) = clock.run(batch) {
            // Faults are captured in the report; stop here either way.
            error!(error = %e, cycle = clock.current_cycle(), "Run failed");
            break;
        }
        remaining = remaining.saturating_sub(batch);
    }
    let elapsed = started.elapsed();

    let report = clock.dispose();
    Ok(RunSummary::collect(
        &clock,
        report,
        bus.stats.snapshot(),
        elapsed,
        interrupted,
    ))
}
