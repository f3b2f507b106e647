//! Multiplexes concurrent URBs on one imported device by `seqnum`
//! (§4.4), so a `RetSubmit` completed on one task can be written back by
//! another without the two racing on the socket. The exporter's host
//! bridge is the only side that needs this: once the agent's VHCI
//! attach hands the tunnel's file descriptor to the kernel driver, URB
//! multiplexing is the kernel's problem, not userspace's.

use crate::wire::RetSubmit;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Tracks in-flight URBs so a `RetSubmit` arriving out of order can be
/// routed back to the task that submitted it, and so `CmdUnlink` can
/// find the URB it names.
#[derive(Default)]
pub struct UrbTable {
    inflight: DashMap<u32, oneshot::Sender<RetSubmit>>,
}

impl UrbTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a newly submitted URB and returns the receiver its
    /// reply will be delivered on.
    pub fn register(&self, seqnum: u32) -> oneshot::Receiver<RetSubmit> {
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(seqnum, tx);
        rx
    }

    /// Delivers a reply to whoever is waiting on `seqnum`. Returns
    /// `false` if nothing was waiting (the URB already completed or was
    /// never ours).
    pub fn complete(&self, seqnum: u32, reply: RetSubmit) -> bool {
        if let Some((_, tx)) = self.inflight.remove(&seqnum) {
            let _ = tx.send(reply);
            true
        } else {
            false
        }
    }

    /// An unlink completes when the target URB's reply is emitted (§4.4);
    /// this just tells the caller whether `seqnum` is still outstanding.
    pub fn is_inflight(&self, seqnum: u32) -> bool {
        self.inflight.contains_key(&seqnum)
    }

    pub fn cancel(&self, seqnum: u32) -> bool {
        self.inflight.remove(&seqnum).is_some()
    }

    pub fn cancel_all(&self) -> Vec<u32> {
        let keys: Vec<u32> = self.inflight.iter().map(|e| *e.key()).collect();
        for k in &keys {
            self.inflight.remove(k);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::UrbHeader;

    fn reply(seqnum: u32) -> RetSubmit {
        RetSubmit {
            header: UrbHeader {
                command: crate::wire::USBIP_RET_SUBMIT,
                seqnum,
                devid: 1,
                direction: 0,
                ep: 0,
            },
            status: 0,
            payload: vec![],
        }
    }

    #[tokio::test]
    async fn reply_routes_to_registered_waiter() {
        let table = UrbTable::new();
        let rx = table.register(7);
        assert!(table.complete(7, reply(7)));
        let got = rx.await.unwrap();
        assert_eq!(got.header.seqnum, 7);
    }

    #[test]
    fn unknown_seqnum_completion_is_noop() {
        let table = UrbTable::new();
        assert!(!table.complete(3, reply(3)));
    }

    #[test]
    fn cancel_all_clears_table() {
        let table = UrbTable::new();
        let _rx1 = table.register(1);
        let _rx2 = table.register(2);
        let mut cancelled = table.cancel_all();
        cancelled.sort();
        assert_eq!(cancelled, vec![1, 2]);
        assert!(!table.is_inflight(1));
    }
}
