//! Feeds device-appearance events into [`boardshare_usbip::UsbHost`]
//! (§4.3's "don't probe twice" binding rule). A real deployment wires a
//! udev rule that writes the new device's bus id to this socket whenever
//! a managed device attaches; we don't implement the udev rule itself,
//! only the side that consumes it.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tracing::info;

use crate::state::ExporterState;

pub async fn run(socket_path: &std::path::Path, state: Arc<ExporterState>) -> std::io::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "uevent socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let busid = line.trim();
                if busid.is_empty() {
                    continue;
                }
                state.usb_host.uevent(busid, &state.managed_busids);
            }
        });
    }
}
