pub mod autoreturn;
pub mod config;
pub mod hub_client;
pub mod ipc;
pub mod reservation;
pub mod tcp_forward;
pub mod tunnel;
pub mod usb_attach;
