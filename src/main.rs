use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};

use stressgen::config::{LogFormat, LoggingConfig};
use stressgen::stats::report::{format_rate, format_summary};
use stressgen::worker::process::run_worker_process;
use stressgen::worker::protocol::WorkerLaunch;
use stressgen::{FloodConfig, Protocol, Session, StressConfig, TracingSink, WorkerMode};

#[derive(Parser)]
#[command(
    name = "stressgen",
    about = "Adaptive-rate ICMP / TCP SYN / UDP traffic generator",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $STRESSGEN_CONFIG, then the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send traffic at a target rate until the duration elapses or Ctrl-C
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Process-worker entry point (started by `run` in process mode)
    #[command(hide = true)]
    Worker {
        /// JSON launch description
        #[arg(long)]
        launch: String,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("target_rate").required(true).args(["rate", "mbps"])))]
struct RunArgs {
    /// Traffic type: icmp, tcp (SYN) or udp
    #[arg(long, short = 'p')]
    protocol: Protocol,

    /// Target IPv4 address or host name
    #[arg(long, short = 't')]
    target: String,

    /// Destination port (TCP and UDP)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Target rate in bytes per second
    #[arg(long)]
    rate: Option<u64>,

    /// Target rate in megabits per second
    #[arg(long)]
    mbps: Option<f64>,

    /// Number of workers (default: engine.default_parallelism or CPU count)
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Bytes per packet (default depends on protocol)
    #[arg(long)]
    packet_size: Option<usize>,

    /// Stop after this long, e.g. 30s, 5m, 500ms
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Worker mode: thread or process
    #[arg(long)]
    mode: Option<WorkerMode>,

    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StressConfig::load(path)?,
        None => StressConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Worker { launch } => {
            let launch: WorkerLaunch =
                serde_json::from_str(&launch).context("invalid worker launch description")?;
            run_worker_process(launch).await
        }
    }
}

/// Logs go to stderr; stdout carries results (and the worker protocol).
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(mut config: StressConfig, args: RunArgs) -> Result<()> {
    if let Some(mode) = args.mode {
        config.engine.worker_mode = mode;
    }

    let rate = match (args.rate, args.mbps) {
        (Some(rate), _) => rate,
        (None, Some(mbps)) => mbps_to_bytes_per_sec(mbps)?,
        (None, None) => bail!("either --rate or --mbps is required"),
    };

    let flood = FloodConfig {
        protocol: args.protocol,
        target_address: args.target,
        target_port: args.port,
        target_rate_bytes_per_sec: rate,
        parallelism: args.workers,
        packet_size: args.packet_size,
    };

    let mut session = Session::new(config, Arc::new(TracingSink));
    let handle = session.start(flood).await.context("failed to start flood")?;
    println!(
        "Sending {} to {} at {} with {} worker(s), Ctrl-C to stop",
        handle.protocol,
        handle.target,
        format_rate(handle.target_rate_bytes_per_sec as f64),
        handle.workers
    );

    let reason = match args.duration {
        Some(duration) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupted",
            _ = tokio::time::sleep(duration) => "duration elapsed",
        },
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            "interrupted"
        }
    };
    tracing::info!(reason, "stopping");

    if let Some(report) = session.stop().await {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report.final_snapshot)?);
        } else {
            println!("{}", format_summary(&report.final_snapshot));
            if report.forced_exits() > 0 {
                println!("{} worker(s) had to be forced to stop", report.forced_exits());
            }
        }
    }

    Ok(())
}

/// 1 Mbps = 125,000 bytes per second.
fn mbps_to_bytes_per_sec(mbps: f64) -> Result<u64> {
    if !mbps.is_finite() || mbps <= 0.0 {
        bail!("--mbps must be a positive number, got {}", mbps);
    }
    Ok((mbps * 125_000.0).round() as u64)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit '{}' (use ms, s, m or h)", other)),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}
