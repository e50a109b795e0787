use clap::Parser;
use cni_node::config::{Cli, Commands};
use cni_node::{Result, agent, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(agent_args) => {
            setup_subscriber();

            let ready = CancellationToken::new();
            let cancel = CancellationToken::new();
            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                agent_args.metrics_address,
                ready.clone(),
                cancel.child_token(),
            ));
            let mut agent_handle =
                tokio::spawn(agent::start(agent_args, ready, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(shutdown_signal());
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => {
                    exit("metrics", h);
                    cancel.cancel();
                    exit("agent", agent_handle.await);
                },
                h = &mut agent_handle => {
                    exit("agent", h);
                    cancel.cancel();
                    exit("metrics", metrics_handle.await);
                },
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (metrics, agent) = tokio::join!(metrics_handle, agent_handle);
                    exit("metrics", metrics);
                    exit("agent", agent);
                },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cni_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
