//! Command-line configuration for the hub binary. The hub has no TOML
//! file of its own (unlike the exporter's [`boardshare_model::ExportDescription`]
//! and the agent's [`boardshare_model::ImportDescription`]) — its only
//! inputs are where to listen and, optionally, a static token table.

use clap::Parser;
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(name = "boardshare-hub", about = "Matches importers to exported places")]
pub struct Cli {
    /// Address to bind the control-channel HTTP/WebSocket listener on.
    #[arg(long, default_value = "0.0.0.0:7070")]
    pub listen: SocketAddr,

    /// Path to a `token = "name:role,role"` auth table. Without one, any
    /// peer is granted both the exporter and importer roles.
    #[arg(long)]
    pub auth_table: Option<std::path::PathBuf>,

    /// Log filter, as accepted by `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "boardshare_hub=info")]
    pub log: String,
}
