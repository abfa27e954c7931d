//! CLI entry point for rust_eudaq
//!
//! Each subcommand runs one role of a distributed DAQ:
//! - `run-control`: accept roles and drive one scripted run
//! - `data-collector`: merge events from producers and write composites
//! - `log-collector`: gather log messages from every role
//! - `producer`: simulated event source
//!
//! # Usage
//!
//! ```bash
//! rust_eudaq run-control --peers 3 --duration 10 --run-config config/run.toml
//! rust_eudaq log-collector --output daq.log
//! rust_eudaq data-collector
//! rust_eudaq producer --name sim1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use rust_eudaq::command_receiver::{CommandHandler, CommandReceiver};
use rust_eudaq::config::{CommandReceiverConfig, DaqConfig};
use rust_eudaq::data_collector::DataCollector;
use rust_eudaq::event::EventRegistry;
use rust_eudaq::log::LogCollector;
use rust_eudaq::producer::{ExampleProducer, Producer};
use rust_eudaq::run_config::Configuration;
use rust_eudaq::run_control::{Failures, RunControl};
use rust_eudaq::telemetry;
use rust_eudaq::writer::WriterRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "rust_eudaq")]
#[command(about = "Distributed DAQ control plane", long_about = None)]
struct Cli {
    /// Process configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept roles and drive one run through its full cycle
    RunControl {
        /// Roles to wait for before initialising
        #[arg(long, default_value = "1")]
        peers: usize,

        /// Seconds to wait for those roles
        #[arg(long, default_value = "30")]
        wait: u64,

        /// Run configuration (TOML) sent with INIT and CONFIG
        #[arg(long)]
        run_config: Option<PathBuf>,

        /// Run number; the next one is used when omitted
        #[arg(long)]
        run: Option<u32>,

        /// Seconds to keep the run going
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Merge events from producers and hand composites to a file writer
    DataCollector {
        /// Role name
        #[arg(long, default_value = "")]
        name: String,

        /// DATA listen address, overriding the configuration
        #[arg(long)]
        listen: Option<String>,
    },

    /// Collect log messages from every role
    LogCollector {
        /// Role name
        #[arg(long, default_value = "")]
        name: String,

        /// Append messages to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Simulated producer sending random payloads
    Producer {
        /// Role name
        #[arg(long, default_value = "example")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DaqConfig::load_from(path),
        None => DaqConfig::load(),
    }
    .context("loading configuration")?;
    config.validate().context("validating configuration")?;
    telemetry::init_from_config(&config)?;

    match cli.command {
        Commands::RunControl {
            peers,
            wait,
            run_config,
            run,
            duration,
            json,
        } => {
            let script = RunScript {
                peers,
                wait: Duration::from_secs(wait),
                run_config,
                run,
                duration: Duration::from_secs(duration),
                json,
            };
            run_control(&config, script).await
        }
        Commands::DataCollector { name, listen } => {
            let mut settings = config.data_collector.clone();
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            let collector = DataCollector::new(
                settings,
                Arc::new(EventRegistry::with_defaults()),
                Arc::new(WriterRegistry::with_defaults()),
            )
            .await?;
            info!("DataCollector receiving on {}", collector.address());
            let collector = serve_role("DataCollector", &name, collector, &config.command_receiver).await?;
            collector.shutdown().await;
            Ok(())
        }
        Commands::LogCollector { name, output } => {
            let output = output.or_else(|| config.log_collector.output.clone());
            let collector = LogCollector::listen(&config.log_collector.listen, output).await?;
            let collector = serve_role("LogCollector", &name, collector, &config.command_receiver).await?;
            collector.shutdown().await;
            Ok(())
        }
        Commands::Producer { name } => {
            let producer = Producer::new(ExampleProducer::new());
            serve_role("Producer", &name, producer, &config.command_receiver).await?;
            Ok(())
        }
    }
}

/// Connects `handler` to RunControl and runs its command loop until
/// TERMINATE, disconnect or Ctrl+C.
async fn serve_role<H>(role: &str, name: &str, handler: H, config: &CommandReceiverConfig) -> Result<H>
where
    H: CommandHandler + 'static,
{
    let receiver = CommandReceiver::connect(role, name, handler, config)
        .await
        .with_context(|| format!("connecting {role} to RunControl at {}", config.run_control))?;
    let cancel = receiver.cancel_token();
    let mut task = receiver.spawn();
    let handler = tokio::select! {
        joined = &mut task => joined??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, leaving command loop");
            cancel.cancel();
            task.await??
        }
    };
    Ok(handler)
}

struct RunScript {
    peers: usize,
    wait: Duration,
    run_config: Option<PathBuf>,
    run: Option<u32>,
    duration: Duration,
    json: bool,
}

async fn run_control(config: &DaqConfig, script: RunScript) -> Result<()> {
    let run_config = match &script.run_config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Configuration::parse(&text)?
        }
        None => Configuration::default(),
    };

    let rc = RunControl::listen(config.run_control.clone()).await?;
    info!("Waiting for {} roles on {}", script.peers, rc.address());
    if let Err(e) = rc.wait_for_peers(script.peers, script.wait).await {
        rc.shutdown().await;
        return Err(e.into());
    }

    report("INIT", rc.initialise(&run_config).await);
    report("CONFIG", rc.configure(&run_config).await);
    let (run, failures) = rc.start_run(script.run).await;
    report("START", failures);
    info!(run, "Run started, taking data for {:?}", script.duration);

    tokio::select! {
        _ = tokio::time::sleep(script.duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping run early"),
    }
    report("STOP", rc.stop_run().await);

    let status = rc.poll_status().await;
    if script.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for peer in &status {
            let message = peer.status.as_ref().map(|s| s.to_string()).unwrap_or_default();
            println!("{:>14}.{:<12} {:<8} {}", peer.role, peer.name, peer.state(), message);
        }
    }

    rc.terminate().await;
    info!(run, "Run complete");
    Ok(())
}

fn report(step: &str, failures: Failures) {
    if failures.is_empty() {
        info!("{} succeeded for every role", step);
        return;
    }
    warn!("{} failed for {} role(s)", step, failures.len());
    for (peer, e) in failures {
        error!("  {}: {}", peer, e);
    }
}
