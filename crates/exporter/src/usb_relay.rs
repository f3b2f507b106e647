//! Host side of a `usb:` tunnel (§4.3, §4.4): runs the `OP_REQ_IMPORT` /
//! `OP_REP_IMPORT` handshake over the already-established CONNECT
//! socket, then relays `CMD_SUBMIT`/`CMD_UNLINK` URBs against the
//! device's bound bus id, multiplexed by `seqnum`.

use std::sync::Arc;
use std::time::Duration;

use boardshare_usbip::{CmdSubmit, CmdUnlink, OpRepImport, OpReqImport, RetUnlink};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::state::ExporterState;

/// The peek interval used to notice the peer has hung up while we're
/// still waiting on a device that has not appeared yet.
const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run_host_session(mut socket: TcpStream, busid: String, state: Arc<ExporterState>) {
    let req = match read_op_req_import(&mut socket).await {
        Ok(Some(req)) => req,
        _ => return,
    };
    if req.busid != busid {
        warn!(requested = %req.busid, authorized = %busid, "busid mismatch, closing tunnel");
        let _ = write_frame(&mut socket, &OpRepImport::NotAvailable.encode()).await;
        return;
    }

    let bound = wait_until_bound_or_peer_gone(&mut socket, &busid, &state).await;
    if !bound {
        let _ = write_frame(&mut socket, &OpRepImport::NotAvailable.encode()).await;
        return;
    }

    let info = match state.usb_host.device_info(&busid) {
        Ok(info) => info,
        Err(err) => {
            warn!(%busid, %err, "failed to read device descriptor");
            let _ = write_frame(&mut socket, &OpRepImport::NotAvailable.encode()).await;
            return;
        }
    };
    if write_frame(&mut socket, &OpRepImport::Ok(info).encode())
        .await
        .is_err()
    {
        return;
    }

    info!(%busid, "usb/ip import accepted, relaying urbs");
    relay_urbs(socket, busid, state).await;
}

async fn wait_until_bound_or_peer_gone(
    socket: &mut TcpStream,
    busid: &str,
    state: &Arc<ExporterState>,
) -> bool {
    let mut probe = [0u8; 1];
    let peer_gone = async {
        loop {
            match socket.peek(&mut probe).await {
                Ok(0) => return,
                Ok(_) => tokio::time::sleep(PEER_CHECK_INTERVAL).await,
                Err(_) => return,
            }
        }
    };
    state.usb_host.wait_until_bound(busid, peer_gone).await
}

/// Reads URB frames off `socket` until it closes, submitting each to the
/// transfer backend and writing back whatever it replies.
async fn relay_urbs(socket: TcpStream, busid: String, state: Arc<ExporterState>) {
    let (mut read_half, write_half) = socket.into_split();
    let write_half = Arc::new(tokio::sync::Mutex::new(write_half));

    loop {
        let mut header_buf = [0u8; 20];
        if read_half.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let mut peek = &header_buf[..];
        let command = u32::from_be_bytes(peek[..4].try_into().unwrap());

        match command {
            boardshare_usbip::wire::USBIP_CMD_SUBMIT => {
                let mut rest = vec![0u8; 20]; // transfer_flags, transfer_buffer_length, start_frame, number_of_packets, interval
                if read_half.read_exact(&mut rest).await.is_err() {
                    break;
                }
                let mut setup = [0u8; 8];
                if read_half.read_exact(&mut setup).await.is_err() {
                    break;
                }
                let transfer_buffer_length = u32::from_be_bytes(rest[4..8].try_into().unwrap());
                let mut payload = vec![0u8; transfer_buffer_length as usize];
                if !payload.is_empty() && read_half.read_exact(&mut payload).await.is_err() {
                    break;
                }

                let mut full = Vec::with_capacity(48 + payload.len());
                full.extend_from_slice(&header_buf);
                full.extend_from_slice(&rest);
                full.extend_from_slice(&setup);
                full.extend_from_slice(&payload);
                let Ok(cmd) = CmdSubmit::decode(&full) else {
                    break;
                };

                let seqnum = cmd.header.seqnum;
                let reply_rx = state.urb_table.register(seqnum);
                let urb_table = state.urb_table.clone();
                let backend = state.transfer_backend.clone();
                let busid_owned = busid.clone();
                tokio::spawn(async move {
                    let reply = backend.submit(&busid_owned, cmd).await;
                    urb_table.complete(seqnum, reply);
                });
                let write_half = write_half.clone();
                tokio::spawn(async move {
                    if let Ok(reply) = reply_rx.await {
                        let bytes = reply.encode();
                        let mut w = write_half.lock().await;
                        let _ = w.write_all(&bytes).await;
                    }
                });
            }
            boardshare_usbip::wire::USBIP_CMD_UNLINK => {
                let mut rest = vec![0u8; 4];
                if read_half.read_exact(&mut rest).await.is_err() {
                    break;
                }
                let mut padding = [0u8; 24];
                if read_half.read_exact(&mut padding).await.is_err() {
                    break;
                }
                let mut full = Vec::with_capacity(28);
                full.extend_from_slice(&header_buf);
                full.extend_from_slice(&rest);
                let Ok(unlink) = CmdUnlink::decode(&full) else {
                    break;
                };
                state
                    .transfer_backend
                    .unlink(&busid, unlink.unlink_seqnum);
                let reply = RetUnlink {
                    header: boardshare_usbip::UrbHeader {
                        command: boardshare_usbip::wire::USBIP_RET_UNLINK,
                        seqnum: unlink.header.seqnum,
                        devid: unlink.header.devid,
                        direction: 0,
                        ep: 0,
                    },
                    status: 0,
                };
                let bytes = reply.encode();
                let mut w = write_half.lock().await;
                if w.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }

    state.urb_table.cancel_all();
    state.usb_host.release(&busid);
    info!(%busid, "usb/ip relay session ended");
}

async fn read_op_req_import(socket: &mut TcpStream) -> std::io::Result<Option<OpReqImport>> {
    let mut buf = [0u8; 8 + 32];
    socket.read_exact(&mut buf).await?;
    Ok(OpReqImport::decode(&buf).ok())
}

async fn write_frame(socket: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    socket.write_all(bytes).await
}
