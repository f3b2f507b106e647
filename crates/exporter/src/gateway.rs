//! The exporter's tunnel gateway (§6): one TCP listener on the place's
//! registered port accepting HTTP/1.1 `CONNECT` requests whose authority
//! names either a TCP endpoint (`tcp:<iface>@<place_id>`) or a USB
//! endpoint (`usb:<iface>@<place_id>`). Each accepted connection becomes
//! one raw, bidirectional pipe for the life of the tunnel — there is no
//! WebSocket framing on this side, unlike the hub control channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::state::{AuthOutcome, ExporterState};
use crate::usb_relay;

const MAX_REQUEST_LINE: usize = 4096;

pub async fn run(state: Arc<ExporterState>) -> std::io::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], state.gateway_port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, peer, &state).await {
                warn!(%peer, %err, "gateway connection ended with error");
            }
        });
    }
}

struct ConnectRequest {
    authority: String,
    bearer: Option<String>,
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    state: &Arc<ExporterState>,
) -> std::io::Result<()> {
    let request = match read_connect_request(&mut socket).await {
        Ok(Some(req)) => req,
        Ok(None) => {
            write_status(&mut socket, 400, "Bad Request").await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let Some(target) = parse_authority(&request.authority) else {
        write_status(&mut socket, 404, "Not Found").await?;
        return Ok(());
    };

    let Some(token) = request.bearer.as_deref() else {
        write_status(&mut socket, 401, "Unauthorized").await?;
        return Ok(());
    };

    match state.authorize(target.place_id, token, peer.ip()) {
        AuthOutcome::Ok => {}
        AuthOutcome::BadToken => {
            write_status(&mut socket, 401, "Unauthorized").await?;
            return Ok(());
        }
        AuthOutcome::WrongIp => {
            write_status(&mut socket, 403, "Forbidden").await?;
            return Ok(());
        }
    }

    match target.kind {
        TargetKind::Tcp => {
            // For `tcp:`, the authority's middle token is an interface
            // name, resolved against the part that advertises it.
            let Some(part) = state.find_part(&target.iface) else {
                write_status(&mut socket, 404, "Not Found").await?;
                return Ok(());
            };
            let Some(endpoint) = part.tcp.get(&target.iface) else {
                write_status(&mut socket, 404, "Not Found").await?;
                return Ok(());
            };
            let addr = format!("{}:{}", endpoint.host, endpoint.port);
            let upstream = match TcpStream::connect(&addr).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(%addr, %err, "upstream unreachable");
                    write_status(&mut socket, 502, "Bad Gateway").await?;
                    return Ok(());
                }
            };
            write_status(&mut socket, 200, "Connection Established").await?;
            splice(socket, upstream).await;
        }
        TargetKind::Usb => {
            // For `usb:`, the agent's VHCI client presents the bus id
            // itself (the value side of a part's `usb` map), not an
            // interface name, so it's checked against the managed set
            // directly rather than looked up as a key.
            let busid = target.iface;
            if !state.managed_busids.contains(&busid) {
                write_status(&mut socket, 404, "Not Found").await?;
                return Ok(());
            }
            write_status(&mut socket, 200, "Connection Established").await?;
            usb_relay::run_host_session(socket, busid, state.clone()).await;
        }
    }

    Ok(())
}

enum TargetKind {
    Tcp,
    Usb,
}

struct Target {
    kind: TargetKind,
    /// An interface name for `TargetKind::Tcp`; a USB/IP bus id (what
    /// the agent's VHCI client actually has on hand) for `TargetKind::Usb`.
    iface: String,
    place_id: boardshare_model::PlaceId,
}

/// Parses `tcp:<iface>@<place_id>` / `usb:<busid>@<place_id>` (§6).
fn parse_authority(authority: &str) -> Option<Target> {
    let (scheme, rest) = authority.split_once(':')?;
    let kind = match scheme {
        "tcp" => TargetKind::Tcp,
        "usb" => TargetKind::Usb,
        _ => return None,
    };
    let (iface, place_id) = rest.split_once('@')?;
    let place_id: boardshare_model::PlaceId = place_id.parse().ok()?;
    Some(Target {
        kind,
        iface: iface.to_string(),
        place_id,
    })
}

async fn read_connect_request(socket: &mut TcpStream) -> std::io::Result<Option<ConnectRequest>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() > MAX_REQUEST_LINE {
            return Ok(None);
        }
        if socket.read_exact(&mut byte).await.is_err() {
            return Ok(None);
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(authority)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    if method != "CONNECT" {
        return Ok(None);
    }

    let mut bearer = None;
    for line in lines {
        if let Some(value) = line.strip_prefix("Authorization: Bearer ") {
            bearer = Some(value.trim().to_string());
        }
    }

    Ok(Some(ConnectRequest {
        authority: authority.to_string(),
        bearer,
    }))
}

async fn write_status(socket: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
    let line = format!("HTTP/1.1 {code} {reason}\r\n\r\n");
    socket.write_all(line.as_bytes()).await
}

async fn splice(mut a: TcpStream, mut b: TcpStream) {
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((to_b, to_a)) => info!(to_b, to_a, "tunnel closed"),
        Err(err) => warn!(%err, "tunnel relay error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_authority() {
        let target = parse_authority("tcp:scpi@3").unwrap();
        assert!(matches!(target.kind, TargetKind::Tcp));
        assert_eq!(target.iface, "scpi");
        assert_eq!(target.place_id, 3);
    }

    #[test]
    fn parses_usb_authority() {
        let target = parse_authority("usb:dut@9").unwrap();
        assert!(matches!(target.kind, TargetKind::Usb));
        assert_eq!(target.place_id, 9);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_authority("ftp:dut@1").is_none());
    }

    #[test]
    fn rejects_missing_place_id() {
        assert!(parse_authority("tcp:scpi").is_none());
    }
}
