//! `iris` binary.
//!
//! `serve` runs the webhook gateway plus the three pipeline workers in one
//! process and drains them on ctrl-c. The `queue` subcommands are the
//! operator surface for the durable job queue: ongoing counts, the parked
//! dead-letter list, and handing a parked job back to its queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use iris_connectors::{
    parse_signature_enforcement, resolve_signature_enforcement_from_env, ConnectorRegistry,
    SignatureEnforcement,
};
use iris_gateway::{run_gateway_server, GatewayState};
use iris_pipeline::{
    CampaignWorker, InboundWorker, OutboundWorker, CAMPAIGN_QUEUE, INBOUND_QUEUE, OUTBOUND_QUEUE,
};
use iris_queue::{run_queue_worker, JobHandler, JobQueue, QueueWorkerOptions};
use iris_store::HelpdeskStore;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "iris", about = "Multi-tenant helpdesk message pipeline", version)]
struct Cli {
    #[arg(
        long,
        env = "IRIS_DATA_DIR",
        default_value = ".iris",
        help = "Directory holding helpdesk.sqlite3 and jobs.sqlite3"
    )]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the webhook gateway and the three pipeline workers
    Serve {
        #[arg(
            long,
            env = "IRIS_BIND",
            default_value = "127.0.0.1:8080",
            help = "Gateway listen address"
        )]
        bind: String,

        #[arg(
            long = "signature-policy",
            help = "Webhook signature policy (strict|permissive); falls back to IRIS_WEBHOOK_SIGNATURE_POLICY, then strict"
        )]
        signature_policy: Option<String>,
    },
    /// Inspect and operate the durable job queue
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Show per-queue job counts by status
    Status,
    /// List parked jobs awaiting operator action
    Parked {
        #[arg(long, default_value_t = 20, help = "Maximum number of jobs to list")]
        limit: u32,
    },
    /// Reset a parked job's attempts and hand it back to its queue
    Retry { job_id: i64 },
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve {
            bind,
            signature_policy,
        } => {
            let enforcement = resolve_enforcement(signature_policy.as_deref())?;
            run_serve(&cli.data_dir, &bind, enforcement).await
        }
        Command::Queue { action } => run_queue_command(&cli.data_dir, action),
    }
}

/// An explicit flag must parse or the command fails; only the environment
/// fallback degrades to strict silently-with-warning.
fn resolve_enforcement(flag: Option<&str>) -> Result<SignatureEnforcement> {
    match flag {
        Some(value) => parse_signature_enforcement(value),
        None => Ok(resolve_signature_enforcement_from_env()),
    }
}

async fn run_serve(data_dir: &Path, bind: &str, enforcement: SignatureEnforcement) -> Result<()> {
    let store = Arc::new(HelpdeskStore::new(data_dir.join("helpdesk.sqlite3")));
    let queue = Arc::new(JobQueue::new(data_dir.join("jobs.sqlite3")));
    let registry = Arc::new(ConnectorRegistry::new());
    tracing::info!(
        data_dir = %data_dir.display(),
        policy = enforcement.as_str(),
        "starting iris pipeline"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers: Vec<(&str, Arc<dyn JobHandler>)> = vec![
        (
            INBOUND_QUEUE,
            Arc::new(InboundWorker::new(Arc::clone(&store))),
        ),
        (
            OUTBOUND_QUEUE,
            Arc::new(OutboundWorker::new(
                Arc::clone(&store),
                Arc::clone(&registry),
            )),
        ),
        (
            CAMPAIGN_QUEUE,
            Arc::new(CampaignWorker::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                Arc::clone(&registry),
            )),
        ),
    ];
    let mut worker_tasks = Vec::new();
    for (queue_name, handler) in workers {
        worker_tasks.push(tokio::spawn(run_queue_worker(
            Arc::clone(&queue),
            QueueWorkerOptions::new(queue_name),
            handler,
            shutdown_rx.clone(),
        )));
    }

    let state = Arc::new(GatewayState::new(store, queue, registry, enforcement));
    let gateway_bind = bind.to_string();
    let gateway_shutdown = shutdown_rx.clone();
    let gateway_task =
        tokio::spawn(
            async move { run_gateway_server(&gateway_bind, state, gateway_shutdown).await },
        );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received; draining workers");
    let _ = shutdown_tx.send(true);

    for task in worker_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!("worker exited with error: {error:#}"),
            Err(error) => tracing::warn!("worker task aborted: {error}"),
        }
    }
    match gateway_task.await {
        Ok(result) => result,
        Err(error) => Err(anyhow!("gateway task aborted: {error}")),
    }
}

fn run_queue_command(data_dir: &Path, action: QueueCommand) -> Result<()> {
    let queue = JobQueue::new(data_dir.join("jobs.sqlite3"));
    match action {
        QueueCommand::Status => {
            let counts = queue.counts_by_queue()?;
            if counts.is_empty() {
                println!("no jobs recorded");
                return Ok(());
            }
            for (queue_name, count) in counts {
                println!(
                    "{queue_name}: queued={} active={} completed={} parked={}",
                    count.queued, count.active, count.completed, count.parked
                );
            }
            Ok(())
        }
        QueueCommand::Parked { limit } => {
            let jobs = queue.list_parked(limit)?;
            if jobs.is_empty() {
                println!("no parked jobs");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "id={} queue={} kind={} attempts={}/{} error={}",
                    job.id,
                    job.queue,
                    job.kind,
                    job.attempts,
                    job.max_attempts,
                    job.last_error.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        QueueCommand::Retry { job_id } => {
            queue.retry_parked(job_id)?;
            println!("job {job_id} handed back to its queue");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cli_parses_serve_with_signature_policy() {
        let cli = Cli::try_parse_from([
            "iris",
            "--data-dir",
            "/tmp/iris",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--signature-policy",
            "permissive",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/iris"));
        match cli.command {
            Command::Serve {
                bind,
                signature_policy,
            } => {
                assert_eq!(bind, "0.0.0.0:9000");
                assert_eq!(signature_policy.as_deref(), Some("permissive"));
            }
            other => panic!("expected serve, parsed {other:?}"),
        }
    }

    #[test]
    fn unit_cli_parses_queue_operator_commands() {
        let cli = Cli::try_parse_from(["iris", "queue", "retry", "42"]).expect("parse");
        match cli.command {
            Command::Queue {
                action: QueueCommand::Retry { job_id },
            } => assert_eq!(job_id, 42),
            other => panic!("expected queue retry, parsed {other:?}"),
        }

        let cli = Cli::try_parse_from(["iris", "queue", "parked", "--limit", "5"]).expect("parse");
        match cli.command {
            Command::Queue {
                action: QueueCommand::Parked { limit },
            } => assert_eq!(limit, 5),
            other => panic!("expected queue parked, parsed {other:?}"),
        }
    }

    #[test]
    fn unit_explicit_signature_policy_must_parse() {
        assert_eq!(
            resolve_enforcement(Some("permissive")).expect("parse"),
            SignatureEnforcement::Permissive
        );
        assert_eq!(
            resolve_enforcement(Some("STRICT")).expect("parse"),
            SignatureEnforcement::Strict
        );
        assert!(resolve_enforcement(Some("bogus")).is_err());
    }
}
