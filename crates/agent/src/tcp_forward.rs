//! A reserved part's TCP interface (§4.5): listens on
//! `127.0.0.1:local_port`, and for each accepted connection opens a new
//! CONNECT tunnel to `tcp:<iface>@<place_id>` and splices. The listener
//! itself survives a dropped tunnel; only the one connection that lost
//! its tunnel fails.

use boardshare_model::PlaceId;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::tunnel;

pub fn spawn(
    local_port: u16,
    iface: String,
    place_id: PlaceId,
    host: String,
    port: u16,
    token: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = (std::net::Ipv4Addr::LOCALHOST, local_port);
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!(local_port, %err, "failed to bind forwarder");
                return;
            }
        };
        info!(local_port, %iface, place_id, "tcp forwarder listening");

        loop {
            let (client, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "accept failed on tcp forwarder");
                    continue;
                }
            };
            let iface = iface.clone();
            let host = host.clone();
            let token = token.clone();
            tokio::spawn(async move {
                match tunnel::open(&host, port, "tcp", &iface, place_id, &token).await {
                    Ok(upstream) => splice(client, upstream, peer).await,
                    Err(err) => warn!(%peer, %iface, %err, "tunnel open failed"),
                }
            });
        }
    })
}

async fn splice(mut client: TcpStream, mut upstream: TcpStream, peer: std::net::SocketAddr) {
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => info!(%peer, to_upstream, to_client, "forward closed"),
        Err(err) => warn!(%peer, %err, "forward relay error"),
    }
}
