use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use slice_worker::config::{JobConfig, WorkerContext};
use slice_worker::pipeline::StageRegistry;
use slice_worker::{EventBus, Worker, WorkerError};

#[derive(Parser, Debug)]
#[command(name = "slice-worker")]
#[command(version)]
#[command(about = "Worker process that executes slices for an execution controller")]
struct Args {
    /// Hostname part of the worker identity
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Process instance id part of the worker identity
    #[arg(long, default_value = "1")]
    instance_id: String,

    /// Path to the job configuration (JSON)
    #[arg(long)]
    job_file: PathBuf,

    /// Override the job's controller port
    #[arg(long)]
    controller_port: Option<u16>,

    /// Override the job's shutdown timeout (milliseconds)
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,
}

/// Cancellation token that fires on SIGINT or, on unix, SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c, shutting down");
        }
        handler_token.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let job_source = std::fs::read_to_string(&args.job_file)?;
    let mut job: JobConfig = serde_json::from_str(&job_source)?;
    if let Some(port) = args.controller_port {
        job.controller_port = port;
    }
    if let Some(ms) = args.shutdown_timeout_ms {
        job.shutdown_timeout_ms = ms;
    }

    let context = WorkerContext::new(args.hostname, args.instance_id);
    let events = EventBus::default();
    let mut worker = Worker::new(context, job, events, StageRegistry::default())?;
    worker.initialize().await?;
    let worker = Arc::new(worker);

    let shutdown = install_signal_handler();

    loop {
        // Each slice runs on its own task: a signal must not abandon the
        // in-flight slice mid-pipeline. On shutdown the task keeps
        // running and the watchdog below waits for it to settle.
        let mut run = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run_once().await }
        });

        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = &mut run => match result {
                Ok(Ok(())) => {}
                Ok(Err(WorkerError::SliceFailed(message))) => {
                    // Slice-level failures never bring the worker down;
                    // the controller has already been notified.
                    tracing::warn!(error = %message, "slice failed, continuing");
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "worker stopping");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "slice task failed");
                    break;
                }
            }
        }
    }

    worker.shutdown(None).await?;
    Ok(())
}
