use clap::{Parser, Subcommand};
use hoststat::clock::SystemClock;
use hoststat::facts::SysinfoFacts;
use hoststat::metrics::Metrics;
use hoststat::{Config, Engine};
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Straggling disk queries get this long to finish once output is written.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "hoststat")]
#[command(version, about = "Host telemetry snapshots as JSON")]
struct Cli {
    /// YAML config file; built-in defaults when omitted
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    /// Single-line JSON instead of pretty-printed
    #[arg(long, global = true)]
    compact: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Print one snapshot (default)
    Snapshot,
    /// Host identity, CPU metadata and a current snapshot
    Base,
    /// Processes using the most CPU
    TopCpu,
    /// Processes using the most resident memory
    TopMem,
    /// Print a snapshot every watch interval until Ctrl+C
    Watch,
    /// Collector self-metrics in Prometheus text format after one snapshot
    Metrics,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load config");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    let facts = Arc::new(SysinfoFacts::new(&cfg.proc_root));
    let engine = Engine::new(facts, Arc::new(SystemClock), cfg, metrics);
    let command = cli.command.unwrap_or(Command::Snapshot);

    let result = runtime.block_on(run(&engine, command, cli.compact));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    if let Err(err) = result {
        error!(error = %err, "command failed");
        std::process::exit(1);
    }
}

async fn run(engine: &Engine, command: Command, compact: bool) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Snapshot => print_json(&engine.build_snapshot().await, compact)?,
        Command::Base => print_json(&engine.get_base_facts().await, compact)?,
        Command::TopCpu => {
            // Process CPU is measured against the previous refresh.
            tokio::time::sleep(engine.config().cpu.sampling_window()).await;
            print_json(&engine.top_k_by_cpu().await, compact)?;
        }
        Command::TopMem => print_json(&engine.top_k_by_memory().await, compact)?,
        Command::Watch => watch(engine, compact).await?,
        Command::Metrics => {
            engine.build_snapshot().await;
            print!("{}", engine.metrics().encode_metrics()?);
        }
    }
    Ok(())
}

async fn watch(engine: &Engine, compact: bool) -> Result<(), Box<dyn Error>> {
    let interval = Duration::from_secs(engine.config().watch_interval_secs);
    info!(interval = %humantime::format_duration(interval), "watching host");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    error!(error = %err, "failed to wait for Ctrl+C");
                }
                info!("received Ctrl+C, stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                print_json(&engine.build_snapshot().await, compact)?;
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> Result<(), serde_json::Error> {
    let text = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{text}");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
