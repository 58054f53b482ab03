use clap::{Parser, Subcommand};
use kube::client::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod actuator;
mod budget;
mod candidate;
mod clock;
mod cloud_provider;
mod command;
mod controller_loop;
mod events;
mod methods;
mod queue;
mod scheduling;
mod state;
#[cfg(test)]
mod testutil;
mod util;
mod validator;

use actuator::{KubeLauncher, KubeNodeActuator};
use clock::RealClock;
use cloud_provider::StaticCloudProvider;
use controller_loop::ControllerLoop;
use events::ConsoleEventRecorder;
use queue::Queue;
use scheduling::ReferenceOracle;
use state::KubeClusterStateMirror;
use util::Error;

/// Top-level CLI configuration for the binary. Any command line
/// flags should go in here.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Controller loop tick period, in seconds (mirrors `util::POLL_INTERVAL`).
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 10)]
    poll_interval_seconds: u64,

    /// Validator settling TTL, in seconds, before a command is admitted to the queue
    /// (mirrors `util::DEFAULT_VALIDATION_TTL`).
    #[arg(long, env = "VALIDATION_TTL_SECONDS", default_value_t = 15)]
    validation_ttl_seconds: u64,
}

/// List of subcommands for the binary. Clap will convert the
/// name of each enum variant to kebab-case for the CLI.
#[derive(Subcommand)]
enum Command {
    ManageDisruption,
}

/// Secondary entrypoint that runs the appropriate subcommand.
async fn run(client: Client) {
    let cli = Cli::parse();

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(util::metrics::run_server(metrics_port));
    }

    match cli.command {
        Command::ManageDisruption => {
            run_with_leader_election(
                client,
                Duration::from_secs(cli.poll_interval_seconds),
                Duration::from_secs(cli.validation_ttl_seconds),
            )
            .await
        }
    }
    .unwrap();

    panic!("exited unexpectedly");
}

/// Leader-elects, then spawns/aborts the controller loop as leadership is gained and
/// lost. Only the leader replica ever runs `ControllerLoop::tick`.
async fn run_with_leader_election(client: Client, poll_interval: Duration, validation_ttl: Duration) -> Result<(), Error> {
    println!("{}", "Starting disruption controller...".green());

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("nlm-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "nlm-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        nlm_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    nlm_common::signal_ready();

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(());
            },
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller loop due to leader election error");
                }
                continue;
            }
        };

        if lease.acquired_lease {
            if controller_task.is_none() {
                println!("acquired leadership; starting controller loop");
                let client = client.clone();
                controller_task = Some(tokio::spawn(run_controller_loop(client, poll_interval, validation_ttl)));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller loop");
            task.abort();
        }
    }
}

/// Drives the disruption controller's own loop: refresh the cluster state mirror, tick
/// once, then either tick again immediately (a command was admitted) or sleep until the
/// next poll.
async fn run_controller_loop(client: Client, poll_interval: Duration, validation_ttl: Duration) {
    let state = Arc::new(KubeClusterStateMirror::new(client.clone()));
    let controller = ControllerLoop {
        state: state.clone(),
        queue: Arc::new(Queue::new_in_memory()),
        actuator: Arc::new(KubeNodeActuator::new(client.clone())),
        launcher: Arc::new(KubeLauncher::new(client.clone())),
        cloud_provider: Arc::new(StaticCloudProvider::default()),
        oracle: Arc::new(ReferenceOracle),
        recorder: Arc::new(ConsoleEventRecorder::default()),
        clock: Arc::new(RealClock),
        validation_ttl,
        #[cfg(feature = "metrics")]
        metrics: util::metrics::Metrics::new(),
    };

    loop {
        if let Err(e) = state.refresh().await {
            eprintln!("cluster state refresh failed: {e}");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        match controller.tick().await {
            Ok(true) => continue,
            Ok(false) => tokio::time::sleep(poll_interval).await,
            Err(e) => {
                eprintln!("controller tick failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Main entrypoint that sets up the environment before running the secondary entrypoint `run`.
#[tokio::main]
async fn main() {
    nlm_common::init();

    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the metrics server or controller may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    // Run the secondary entrypoint.
    run(client).await;

    // This is an unreachable branch. The controller loop and metrics
    // server should never exit without a panic.
    panic!("exited prematurely");
}
