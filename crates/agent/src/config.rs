//! Agent CLI flags. The import description itself (§6) is loaded
//! per-reservation from the path an IPC client names, not once at
//! startup — one running agent manages many named reservations.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "boardshare-agent", about = "Reserves and tunnels places on behalf of local clients")]
pub struct Cli {
    /// Base WebSocket URL of the hub, without the `role`/`token` query
    /// parameters.
    #[arg(long, default_value = "ws://127.0.0.1:7070/ws")]
    pub hub_url: String,

    /// Bearer token presented when opening the hub control channel.
    #[arg(long)]
    pub token: Option<String>,

    /// Unix domain socket the CLI-facing IPC server listens on.
    #[arg(long, default_value = "/run/not-my-board-agent.sock")]
    pub ipc_socket: PathBuf,

    /// Log filter, as accepted by `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "boardshare_agent=info")]
    pub log: String,
}
