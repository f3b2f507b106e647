//! Hub binary entry point: parse CLI flags, build the auth policy,
//! stand up [`boardshare_hub::state::HubContext`] and serve the
//! WebSocket/HTTP surface.

use std::sync::Arc;

use boardshare_hub::auth::{load_auth_table, AuthPolicy, NoopAuthPolicy};
use boardshare_hub::config::Cli;
use boardshare_hub::http::{router, AppState};
use boardshare_hub::state::HubContext;
use boardshare_hub::ws::new_outboxes;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone())),
        )
        .init();

    let auth: Arc<dyn AuthPolicy> = match &cli.auth_table {
        Some(path) => Arc::new(load_auth_table(path)?),
        None => Arc::new(NoopAuthPolicy),
    };

    let state = AppState {
        hub: HubContext::new(),
        auth,
        outboxes: new_outboxes(),
    };

    let app = router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();

    info!(addr = %cli.listen, "boardshare hub listening");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
