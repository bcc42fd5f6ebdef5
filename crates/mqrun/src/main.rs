use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mqrun_process::LifecycleState;

mod artifact_cache;
mod config;
mod download_progress;
mod file_lock;
mod launch;
mod pid_record;
mod port_probe;
mod signal;
mod supervisor;
mod supervisor_support;

use config::SupervisorConfig;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "mqrun", version)]
#[command(about = "Fetch, run and stop a local ElasticMQ server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Start the server in the background and wait for its port
    Start,
    /// Stop the server recorded for the configured port
    Stop,
    /// Check whether the configured port accepts connections
    Status,
    /// Run the server in the foreground until it exits or Ctrl-C
    Console,
}

fn init_tracing() {
    // stdout carries the operator-facing progress text.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command, supervisor: &Supervisor) -> anyhow::Result<()> {
    match command {
        Command::Start => {
            let report = supervisor.start().await?;
            tracing::info!(
                pid = report.pid,
                artifact = %report.artifact.display(),
                attempts = report.probe.attempts,
                state = ?report.state,
                replaced = ?report.replaced,
                "start finished"
            );
        }
        Command::Status => {
            let report = supervisor.status().await;
            tracing::debug!(
                reachable = report.probe.reached,
                state = ?report.state,
                "status finished"
            );
        }
        Command::Stop => {
            let report = supervisor.stop().await?;
            tracing::info!(
                outcome = ?report.outcome,
                attempts = report.probe.attempts,
                "stop finished"
            );
            if report.state == LifecycleState::Unconfirmed && report.outcome.removed_record() {
                tracing::warn!(
                    port = supervisor.config().listen_port,
                    "port still open after stop"
                );
            }
        }
        Command::Console => {
            let report = supervisor.console().await?;
            tracing::info!(
                pid = report.pid,
                exit = %report.exit,
                interrupted = report.interrupted,
                reachable = report.probe.map(|p| p.reached),
                "console session ended"
            );
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let cfg = SupervisorConfig::from_env();
    tracing::debug!(
        url = %cfg.source_url,
        port = cfg.listen_port,
        cache = %cfg.cache_dir.display(),
        "resolved configuration"
    );
    let supervisor = Supervisor::new(cfg);

    match run(cli.command, &supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", supervisor_support::format_error_chain(&e));
            ExitCode::FAILURE
        }
    }
}
