use std::sync::Arc;

use boardshare_agent::config::Cli;
use boardshare_agent::{hub_client, ipc, reservation};
use clap::Parser;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let hub_cell = Arc::new(Mutex::new(None));
    let reservations = reservation::spawn(hub_cell.clone());

    let ipc_socket = cli.ipc_socket.clone();
    let ipc_reservations = reservations.clone();
    let ipc_task = tokio::spawn(async move {
        if let Err(err) = ipc::run(&ipc_socket, ipc_reservations).await {
            tracing::error!(%err, "ipc listener exited");
        }
    });

    hub_client::run(cli.hub_url, cli.token, hub_cell, reservations.sender()).await;
    ipc_task.abort();
    Ok(())
}
