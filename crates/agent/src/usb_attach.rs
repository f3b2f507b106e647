//! A reserved part's USB interface (§4.5): opens a persistent CONNECT
//! tunnel for `usb:<busid>@<place_id>`, runs the USB/IP client handshake
//! in userspace, then hands the tunnel socket's raw descriptor to the
//! kernel's VHCI driver. From that point the kernel owns URB traffic on
//! that socket; detach happens symmetrically when the reservation's
//! interface is torn down and this task is dropped.

use std::os::fd::IntoRawFd;
use std::sync::Arc;

use boardshare_model::PlaceId;
use boardshare_usbip::{
    select_port, OpRepImport, OpReqImport, SysfsVhciController, VhciController, DEVICE_INFO_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::tunnel;

struct DetachGuard {
    port: u8,
    vhci: Arc<dyn VhciController>,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Err(err) = self.vhci.detach(self.port) {
            warn!(port = self.port, %err, "vhci detach failed");
        }
    }
}

pub fn spawn(
    busid: String,
    port_num: u8,
    place_id: PlaceId,
    host: String,
    port: u16,
    token: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let vhci: Arc<dyn VhciController> = Arc::new(SysfsVhciController::new());
        let mut backoff = boardshare_protocol::Backoff::new();
        loop {
            match attach_once(&busid, port_num, place_id, &host, port, &token, &vhci).await {
                Ok(attached_port) => {
                    backoff.reset();
                    info!(%busid, attached_port, "usb/ip device attached");
                    let _guard = DetachGuard {
                        port: attached_port,
                        vhci: vhci.clone(),
                    };
                    // The kernel owns the socket from here; this task's
                    // job is done until the reservation actor aborts it
                    // (detach/return/lost), which runs `_guard`'s drop.
                    std::future::pending::<()>().await;
                }
                Err(err) => {
                    warn!(%busid, %err, "usb/ip attach failed, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    })
}

async fn attach_once(
    busid: &str,
    port_num: u8,
    place_id: PlaceId,
    host: &str,
    port: u16,
    token: &str,
    vhci: &Arc<dyn VhciController>,
) -> std::io::Result<u8> {
    let mut stream = tunnel::open(host, port, "usb", busid, place_id, token)
        .await
        .map_err(|err| std::io::Error::new(err.kind(), err.to_string()))?;

    let req = OpReqImport {
        busid: busid.to_string(),
    };
    stream.write_all(&req.encode()).await?;

    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    let status = u32::from_be_bytes(head[4..8].try_into().unwrap());
    let mut full = head.to_vec();
    if status == 0 {
        let mut rest = vec![0u8; DEVICE_INFO_LEN];
        stream.read_exact(&mut rest).await?;
        full.extend_from_slice(&rest);
    }

    let info = match OpRepImport::decode(&full)? {
        OpRepImport::Ok(info) => info,
        OpRepImport::NotAvailable => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "device not available",
            ))
        }
    };

    let vhci_port = select_port(port_num, info.speed);
    let devid = (info.busnum << 16) | info.devnum;
    let fd = stream.into_std()?.into_raw_fd();
    vhci.attach(vhci_port, fd, busid, devid, info.speed)?;
    Ok(vhci_port)
}
