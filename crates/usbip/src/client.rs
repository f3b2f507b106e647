//! Agent-side VHCI attach/detach (§4.5): once `OP_REP_IMPORT` reports a
//! device, pick a controller port from its speed and hand the tunnel's
//! socket off to the local virtual host controller.

use crate::wire::UsbSpeed;
use std::os::unix::io::RawFd;

/// The VHCI sysfs operations a real deployment performs, behind a trait
/// for the same reason [`crate::host::UsbBridge`] is: testable port
/// selection and bookkeeping without root or a real VHCI driver.
pub trait VhciController: Send + Sync {
    fn attach(&self, port: u8, fd: RawFd, busid: &str, devid: u32, speed: UsbSpeed) -> std::io::Result<()>;
    fn detach(&self, port: u8) -> std::io::Result<()>;
}

pub struct SysfsVhciController {
    attach_node: std::path::PathBuf,
    detach_node: std::path::PathBuf,
}

impl SysfsVhciController {
    pub fn new() -> Self {
        let root = std::path::PathBuf::from("/sys/devices/platform/vhci_hcd.0");
        Self {
            attach_node: root.join("attach"),
            detach_node: root.join("detach"),
        }
    }
}

impl Default for SysfsVhciController {
    fn default() -> Self {
        Self::new()
    }
}

impl VhciController for SysfsVhciController {
    fn attach(&self, port: u8, fd: RawFd, busid: &str, devid: u32, speed: UsbSpeed) -> std::io::Result<()> {
        let speed_wire = match speed {
            UsbSpeed::Low => 1,
            UsbSpeed::Full => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 5,
        };
        let line = format!("{port} {fd} {devid} {speed_wire}");
        let _ = busid;
        std::fs::write(&self.attach_node, line)
    }

    fn detach(&self, port: u8) -> std::io::Result<()> {
        std::fs::write(&self.detach_node, port.to_string())
    }
}

/// Selects the VHCI port for a device given the agent's requested
/// `port_num` (validated to `[0,7]` at the import-description boundary)
/// and the device's discovered speed (§4.5).
pub fn select_port(port_num: u8, speed: UsbSpeed) -> u8 {
    let range = speed.port_range();
    (*range.start()).saturating_add(port_num).min(*range.end())
}

/// Tracks which local ports are attached, keyed by reservation-owned
/// interface name, so `detach` is symmetric with `attach`.
#[derive(Default)]
pub struct AttachTable {
    attached: std::collections::HashMap<String, u8>,
}

impl AttachTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, interface: &str, port: u8) {
        self.attached.insert(interface.to_string(), port);
    }

    pub fn port_for(&self, interface: &str) -> Option<u8> {
        self.attached.get(interface).copied()
    }

    pub fn forget(&mut self, interface: &str) -> Option<u8> {
        self.attached.remove(interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_speed_port_stays_in_low_range() {
        assert_eq!(select_port(0, UsbSpeed::High), 0);
        assert_eq!(select_port(7, UsbSpeed::High), 7);
    }

    #[test]
    fn super_speed_port_shifts_into_high_range() {
        assert_eq!(select_port(0, UsbSpeed::Super), 8);
        assert_eq!(select_port(7, UsbSpeed::Super), 15);
    }

    #[test]
    fn attach_table_round_trips() {
        let mut table = AttachTable::new();
        table.record("dut", 3);
        assert_eq!(table.port_for("dut"), Some(3));
        assert_eq!(table.forget("dut"), Some(3));
        assert_eq!(table.port_for("dut"), None);
    }
}
