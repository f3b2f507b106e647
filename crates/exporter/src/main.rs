use std::path::PathBuf;
use std::sync::Arc;

use boardshare_exporter::config::Cli;
use boardshare_exporter::state::ExporterState;
use boardshare_exporter::{gateway, hub_client, uevent};
use boardshare_model::ExportDescription;
use boardshare_usbip::LoopbackBackend;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let description = ExportDescription::load(&cli.place)?;
    let parts = description.parts();
    let state = ExporterState::new(description.port, parts, Arc::new(LoopbackBackend));

    let uevent_socket = PathBuf::from("/run/boardshare-exporter-uevent.sock");
    let uevent_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = uevent::run(&uevent_socket, uevent_state).await {
            tracing::error!(%err, "uevent listener exited");
        }
    });

    let gateway_state = state.clone();
    let gateway_task = tokio::spawn(async move {
        if let Err(err) = gateway::run(gateway_state).await {
            tracing::error!(%err, "gateway listener exited");
        }
    });

    hub_client::run(cli.hub_url, cli.token, state).await;
    gateway_task.abort();
    Ok(())
}
