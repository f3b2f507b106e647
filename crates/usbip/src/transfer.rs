//! The one hardware seam URB relaying crosses (§4.4 says the protocol is
//! implemented "entirely in user space"; the Non-goals draw the line at
//! raw forwarding, not a hardware abstraction layer). Everything above
//! this trait — opcode framing, `seqnum` multiplexing, unlink-on-close —
//! is real; what a `CmdSubmit` actually does to silicon is intentionally
//! opaque behind it.

use crate::wire::{CmdSubmit, RetSubmit};
use std::future::Future;
use std::pin::Pin;

pub trait UrbTransferBackend: Send + Sync {
    /// Executes one URB against the bound device and returns its reply.
    fn submit<'a>(
        &'a self,
        busid: &'a str,
        cmd: CmdSubmit,
    ) -> Pin<Box<dyn Future<Output = RetSubmit> + Send + 'a>>;

    /// Best-effort cancellation of an in-flight URB; the relay loop
    /// still waits for `submit`'s future to resolve before replying.
    fn unlink(&self, busid: &str, seqnum: u32);
}

/// Answers every submit with a zero-length, zero-status success reply.
/// Stands in for the real device-I/O backend (raw forwarding to the
/// bound device's kernel node) that this workspace does not implement.
pub struct LoopbackBackend;

impl UrbTransferBackend for LoopbackBackend {
    fn submit<'a>(
        &'a self,
        _busid: &'a str,
        cmd: CmdSubmit,
    ) -> Pin<Box<dyn Future<Output = RetSubmit> + Send + 'a>> {
        Box::pin(async move {
            RetSubmit {
                header: crate::wire::UrbHeader {
                    command: crate::wire::USBIP_RET_SUBMIT,
                    ..cmd.header
                },
                status: 0,
                payload: Vec::new(),
            }
        })
    }

    fn unlink(&self, _busid: &str, _seqnum: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::UrbHeader;

    #[tokio::test]
    async fn loopback_echoes_success() {
        let backend = LoopbackBackend;
        let cmd = CmdSubmit {
            header: UrbHeader {
                command: crate::wire::USBIP_CMD_SUBMIT,
                seqnum: 3,
                devid: 1,
                direction: 0,
                ep: 0,
            },
            transfer_flags: 0,
            transfer_buffer_length: 0,
            setup: [0; 8],
            payload: vec![],
        };
        let reply = backend.submit("1-2", cmd).await;
        assert_eq!(reply.header.seqnum, 3);
        assert_eq!(reply.status, 0);
    }
}
