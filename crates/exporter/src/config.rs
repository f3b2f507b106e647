//! Exporter CLI flags and the place description it publishes (§6: the
//! exporter description TOML with top-level `port` and array `parts`).

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "boardshare-exporter", about = "Gateways one place's parts to reserving agents")]
pub struct Cli {
    /// Base WebSocket URL of the hub, without the `role`/`token` query
    /// parameters (those are appended by the control-channel client).
    #[arg(long, default_value = "ws://127.0.0.1:7070/ws")]
    pub hub_url: String,

    /// Path to the TOML place description (§6).
    #[arg(long)]
    pub place: PathBuf,

    /// Bearer token presented when opening the hub control channel.
    #[arg(long)]
    pub token: Option<String>,

    /// Log filter, as accepted by `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "boardshare_exporter=info")]
    pub log: String,
}
