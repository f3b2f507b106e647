//! USB/IP transport (§4.4): the wire codec, the exporter-side host
//! bridge with its block-until-bound import semantics and seqnum-keyed
//! URB multiplexer, and the agent-side VHCI client that hands the
//! tunnel socket off to the kernel once a device is imported.

pub mod client;
pub mod host;
pub mod mux;
pub mod transfer;
pub mod wire;

pub use client::{select_port, AttachTable, SysfsVhciController, VhciController};
pub use host::{SysfsUsbBridge, UsbBridge, UsbHost};
pub use mux::UrbTable;
pub use transfer::{LoopbackBackend, UrbTransferBackend};
pub use wire::{
    CmdSubmit, CmdUnlink, OpReqImport, OpRepImport, RetSubmit, RetUnlink, UrbHeader, UsbDeviceInfo,
    UsbSpeed, DEVICE_INFO_LEN,
};
