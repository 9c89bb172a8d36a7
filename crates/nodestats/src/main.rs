//! nodestats CLI: inspect effective stats settings and breaker limits, and
//! drive a stats service with synthetic producer load.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use nodestats_core::breaker::{BreakerConfig, LOGS, ResourceGuard, TrackingAccounting};
use nodestats_core::error::format_error_with_remediation;
use nodestats_core::log_stream::StreamStats;
use nodestats_core::logging::{LogConfig, LogFormat, init_logging};
use nodestats_core::records::{JobId, epoch_ms};
use nodestats_core::service::StatsService;
use nodestats_core::settings::{
    JOBS_LOG_SIZE, MemorySize, OPERATIONS_LOG_SIZE, RefreshOutcome, SettingsDelta, StatsSettings,
};

/// nodestats - job/operation retention and resource guards
#[derive(Parser, Debug)]
#[command(name = "nodestats")]
#[command(version, about = "Inspect and exercise the node stats subsystem", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(long, short = 'c', global = true, env = "NODESTATS_CONFIG")]
    config: Option<PathBuf>,

    /// Override one setting, e.g. `--set stats.enabled=true` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Memory that percentage breaker limits resolve against
    #[arg(long, global = true, default_value = "1gb", value_parser = parse_available_memory)]
    available_memory: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn", env = "NODESTATS_LOG")]
    log_level: String,

    /// Log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective settings after the file and overrides
    Settings,

    /// Print the registered breaker configs
    Breakers,

    /// Run concurrent producers against a live stats service
    Simulate {
        /// Producer threads
        #[arg(long, default_value_t = 4)]
        producers: usize,

        /// Jobs per producer
        #[arg(long, default_value_t = 1_000)]
        jobs: usize,

        /// Operations per job
        #[arg(long, default_value_t = 3)]
        ops_per_job: u32,

        /// Alternate the log sizes between the configured value and this one
        /// while producers run
        #[arg(long)]
        flip_size: Option<usize>,
    },
}

fn parse_available_memory(raw: &str) -> Result<u64, String> {
    match MemorySize::parse(raw)? {
        MemorySize::Bytes(bytes) => Ok(bytes),
        MemorySize::Percent(_) => Err("available memory must be an absolute size".to_string()),
    }
}

#[derive(Debug, Serialize)]
struct SettingsOutput {
    settings: StatsSettings,
    rejected: Vec<String>,
    ignored: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BreakerOutput {
    #[serde(flatten)]
    config: BreakerConfig,
    limit_human: String,
}

#[derive(Debug, Serialize)]
struct SimulationOutput {
    elapsed_ms: u128,
    jobs_started: usize,
    reconfigurations: usize,
    streams: [StreamStats; 2],
    active_jobs: usize,
    pending_operations: usize,
}

fn load_settings(cli: &Cli) -> Result<RefreshOutcome> {
    let mut delta = match &cli.config {
        Some(path) => SettingsDelta::load(path).map_err(nodestats_core::Error::from)?,
        None => SettingsDelta::new(),
    };
    for raw in &cli.overrides {
        let (key, value) =
            SettingsDelta::parse_assignment(raw).map_err(nodestats_core::Error::from)?;
        delta.set(key, value);
    }
    debug!(keys = delta.len(), "Settings delta assembled");
    Ok(StatsSettings::from_delta(&delta))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_settings(outcome: RefreshOutcome) -> Result<()> {
    print_json(&SettingsOutput {
        settings: outcome.settings,
        rejected: outcome.rejected.iter().map(ToString::to_string).collect(),
        ignored: outcome.ignored,
    })
}

fn run_breakers(settings: &StatsSettings, available_memory: u64) -> Result<()> {
    let guard = ResourceGuard::new(Arc::new(TrackingAccounting::new()), settings, available_memory);
    let breakers: Vec<BreakerOutput> = guard
        .breakers()
        .into_iter()
        .map(|config| BreakerOutput {
            limit_human: config.human_limit(),
            config,
        })
        .collect();
    print_json(&breakers)
}

fn run_simulate(
    settings: StatsSettings,
    available_memory: u64,
    producers: usize,
    jobs: usize,
    ops_per_job: u32,
    flip_size: Option<usize>,
) -> Result<()> {
    if producers == 0 {
        bail!("--producers must be at least 1");
    }
    let base_jobs_size = settings.jobs_log_size;
    let base_ops_size = settings.operations_log_size;
    let service = Arc::new(StatsService::start(
        settings,
        Arc::new(TrackingAccounting::new()),
        available_memory,
    )?);
    info!(producers, jobs, ops_per_job, "Simulation started");

    let started = Instant::now();
    let done = Arc::new(AtomicBool::new(false));

    let refresher = flip_size.map(|flip| {
        let service = Arc::clone(&service);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut rounds = 0usize;
            while !done.load(Ordering::Acquire) {
                let (jobs_size, ops_size) = if rounds % 2 == 0 {
                    (flip, flip)
                } else {
                    (base_jobs_size, base_ops_size)
                };
                let delta = SettingsDelta::new()
                    .with(JOBS_LOG_SIZE, jobs_size.to_string())
                    .with(OPERATIONS_LOG_SIZE, ops_size.to_string());
                if service.refresh(&delta).is_err() {
                    break;
                }
                rounds += 1;
                thread::sleep(Duration::from_millis(1));
            }
            rounds
        })
    });

    let workers: Vec<_> = (0..producers)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for n in 0..jobs {
                    let job = JobId::new_v4();
                    service.jobs().job_started(job, format!("select {n}"), epoch_ms());
                    for op_id in 0..ops_per_job {
                        service
                            .operations()
                            .operation_started(op_id, job, "collect", epoch_ms());
                        let estimate = 64 * u64::from(op_id + 1);
                        let error = match service.guard().check(LOGS, estimate, "operation") {
                            Ok(_) => {
                                service.guard().release(LOGS, estimate);
                                None
                            }
                            Err(trip) => Some(trip.to_string()),
                        };
                        service
                            .operations()
                            .operation_finished(op_id, job, error, Some(u64::from(op_id)));
                    }
                    service.jobs().job_finished(job, epoch_ms(), None);
                }
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
    }
    done.store(true, Ordering::Release);
    let reconfigurations = match refresher {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow::anyhow!("refresh thread panicked"))?,
        None => 0,
    };

    let output = SimulationOutput {
        elapsed_ms: started.elapsed().as_millis(),
        jobs_started: producers * jobs,
        reconfigurations,
        streams: service.stream_stats(),
        active_jobs: service.jobs().active_jobs().len(),
        pending_operations: service.operations().pending_operations().len(),
    };
    service.shutdown();
    debug!(logs_trips = service.guard().accounting().trips(LOGS), "Simulation finished");
    print_json(&output)
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<nodestats_core::Error>() {
        Some(core) => eprintln!("{}", format_error_with_remediation(core)),
        None => eprintln!("Error: {err:#}"),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: None,
    })?;

    let outcome = load_settings(&cli)?;
    for rejected in &outcome.rejected {
        eprintln!("warning: {rejected}");
        eprint!("{}", rejected.remediation().render_plain());
    }

    match cli.command {
        Commands::Settings => run_settings(outcome),
        Commands::Breakers => run_breakers(&outcome.settings, cli.available_memory),
        Commands::Simulate {
            producers,
            jobs,
            ops_per_job,
            flip_size,
        } => run_simulate(
            outcome.settings,
            cli.available_memory,
            producers,
            jobs,
            ops_per_job,
            flip_size,
        ),
    }
}
