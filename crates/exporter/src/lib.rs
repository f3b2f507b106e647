pub mod config;
pub mod gateway;
pub mod hub_client;
pub mod state;
pub mod uevent;
pub mod usb_relay;
