//! Exporter-side host bridge: binds devices to `usbip-host` on uevent,
//! and lets an in-flight `OP_REQ_IMPORT` block until the bus id it asked
//! for becomes bound (§4.3, §4.4's documented deviation from
//! `usbipd`'s `ST_NODEV`).

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The sysfs operations a real deployment performs; kept behind a trait
/// so the "don't probe twice" bind policy can be tested without real
/// hardware or root.
pub trait UsbBridge: Send + Sync {
    fn unbind_current_driver(&self, busid: &str) -> std::io::Result<()>;
    fn write_match_busid(&self, busid: &str) -> std::io::Result<()>;
    fn bind_usbip_host(&self, busid: &str) -> std::io::Result<()>;
    /// Reads the device descriptor fields `OP_REP_IMPORT` needs straight
    /// out of sysfs, rather than tracking a private copy alongside
    /// `bound`.
    fn device_info(&self, busid: &str) -> std::io::Result<crate::wire::UsbDeviceInfo>;
}

/// Writes to the real `usbip-host` driver's sysfs nodes.
pub struct SysfsUsbBridge {
    driver_root: std::path::PathBuf,
}

impl SysfsUsbBridge {
    pub fn new() -> Self {
        Self {
            driver_root: std::path::PathBuf::from("/sys/bus/usb/drivers/usbip-host"),
        }
    }
}

impl Default for SysfsUsbBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBridge for SysfsUsbBridge {
    fn unbind_current_driver(&self, busid: &str) -> std::io::Result<()> {
        let device_driver = std::path::PathBuf::from("/sys/bus/usb/devices")
            .join(busid)
            .join("driver");
        let target = device_driver.join("unbind");
        if device_driver.exists() {
            std::fs::write(target, busid)?;
        }
        Ok(())
    }

    fn write_match_busid(&self, busid: &str) -> std::io::Result<()> {
        std::fs::write(self.driver_root.join("match_busid"), busid)
    }

    fn bind_usbip_host(&self, busid: &str) -> std::io::Result<()> {
        std::fs::write(self.driver_root.join("bind"), busid)
    }

    fn device_info(&self, busid: &str) -> std::io::Result<crate::wire::UsbDeviceInfo> {
        let device_root = std::path::PathBuf::from("/sys/bus/usb/devices").join(busid);
        let read_hex = |name: &str| -> std::io::Result<u32> {
            let raw = std::fs::read_to_string(device_root.join(name))?;
            u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        };
        let read_dec = |name: &str| -> std::io::Result<u32> {
            let raw = std::fs::read_to_string(device_root.join(name))?;
            raw.trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                })
        };
        let speed = match std::fs::read_to_string(device_root.join("speed"))?.trim() {
            "480" => crate::wire::UsbSpeed::High,
            "5000" | "10000" => crate::wire::UsbSpeed::Super,
            "12" => crate::wire::UsbSpeed::Full,
            _ => crate::wire::UsbSpeed::Low,
        };
        Ok(crate::wire::UsbDeviceInfo {
            busid: busid.to_string(),
            path: device_root.to_string_lossy().into_owned(),
            busnum: read_dec("busnum")?,
            devnum: read_dec("devnum")?,
            speed,
            id_vendor: read_hex("idVendor")? as u16,
            id_product: read_hex("idProduct")? as u16,
            bcd_device: read_hex("bcdDevice")? as u16,
            device_class: read_hex("bDeviceClass")? as u8,
            device_subclass: read_hex("bDeviceSubClass")? as u8,
            device_protocol: read_hex("bDeviceProtocol")? as u8,
            configuration_value: read_dec("bConfigurationValue").unwrap_or(0) as u8,
            num_configurations: read_dec("bNumConfigurations")? as u8,
            num_interfaces: read_dec("bNumInterfaces").unwrap_or(1) as u8,
        })
    }
}

/// Tracks which managed bus ids are currently bound to `usbip-host`, and
/// lets `OP_REQ_IMPORT` handlers wait on a bus id until the uevent
/// handler binds it.
pub struct UsbHost<B: UsbBridge> {
    bridge: B,
    bound: DashMap<String, bool>,
    waiters: DashMap<String, Arc<Notify>>,
}

impl<B: UsbBridge> UsbHost<B> {
    pub fn new(bridge: B) -> Self {
        Self {
            bridge,
            bound: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    pub fn is_bound(&self, busid: &str) -> bool {
        self.bound.get(busid).map(|v| *v).unwrap_or(false)
    }

    pub fn device_info(&self, busid: &str) -> std::io::Result<crate::wire::UsbDeviceInfo> {
        self.bridge.device_info(busid)
    }

    fn waiter_for(&self, busid: &str) -> Arc<Notify> {
        self.waiters
            .entry(busid.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// The platform device manager's uevent callback. If `busid` is one
    /// of `managed`, bind it to `usbip-host` and wake any blocked
    /// imports; otherwise defer entirely to the default driver — this
    /// is the "don't probe twice" rule.
    pub fn uevent(&self, busid: &str, managed: &HashSet<String>) {
        if !managed.contains(busid) {
            debug!(busid, "uevent for unmanaged device, deferring to default driver");
            return;
        }
        if self.is_bound(busid) {
            debug!(busid, "already bound, ignoring duplicate uevent");
            return;
        }
        if let Err(e) = self.bind(busid) {
            warn!(busid, error = %e, "failed to bind device to usbip-host");
            return;
        }
        self.bound.insert(busid.to_string(), true);
        info!(busid, "bound device to usbip-host");
        self.waiter_for(busid).notify_waiters();
    }

    fn bind(&self, busid: &str) -> std::io::Result<()> {
        self.bridge.unbind_current_driver(busid)?;
        self.bridge.write_match_busid(busid)?;
        self.bridge.bind_usbip_host(busid)
    }

    /// Marks a bus id unbound (device removed or tunnel released it).
    pub fn release(&self, busid: &str) {
        self.bound.remove(busid);
    }

    /// Blocks until `busid` is bound, or until `cancel` resolves (the
    /// owning CONNECT tunnel closed). This is the deviation from
    /// `usbipd`: `OP_REQ_IMPORT` waits instead of failing `ST_NODEV`.
    pub async fn wait_until_bound<F: std::future::Future<Output = ()>>(
        &self,
        busid: &str,
        cancel: F,
    ) -> bool {
        if self.is_bound(busid) {
            return true;
        }
        let notify = self.waiter_for(busid);
        tokio::select! {
            _ = async {
                loop {
                    let notified = notify.notified();
                    if self.is_bound(busid) {
                        return;
                    }
                    notified.await;
                    if self.is_bound(busid) {
                        return;
                    }
                }
            } => true,
            _ = cancel => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        bound: Mutex<Vec<String>>,
    }

    impl UsbBridge for RecordingBridge {
        fn unbind_current_driver(&self, _busid: &str) -> std::io::Result<()> {
            Ok(())
        }
        fn write_match_busid(&self, _busid: &str) -> std::io::Result<()> {
            Ok(())
        }
        fn bind_usbip_host(&self, busid: &str) -> std::io::Result<()> {
            self.bound.lock().unwrap().push(busid.to_string());
            Ok(())
        }
        fn device_info(&self, busid: &str) -> std::io::Result<crate::wire::UsbDeviceInfo> {
            Ok(crate::wire::UsbDeviceInfo {
                busid: busid.to_string(),
                path: String::new(),
                busnum: 1,
                devnum: 2,
                speed: crate::wire::UsbSpeed::High,
                id_vendor: 0,
                id_product: 0,
                bcd_device: 0,
                device_class: 0,
                device_subclass: 0,
                device_protocol: 0,
                configuration_value: 1,
                num_configurations: 1,
                num_interfaces: 1,
            })
        }
    }

    #[tokio::test]
    async fn unmanaged_uevent_is_ignored() {
        let host = UsbHost::new(RecordingBridge::default());
        let managed = HashSet::new();
        host.uevent("1-2", &managed);
        assert!(!host.is_bound("1-2"));
    }

    #[tokio::test]
    async fn managed_uevent_binds_and_wakes_waiter() {
        let host = Arc::new(UsbHost::new(RecordingBridge::default()));
        let managed: HashSet<String> = ["1-2".to_string()].into_iter().collect();

        let waiter = {
            let host = host.clone();
            tokio::spawn(async move {
                host.wait_until_bound("1-2", std::future::pending::<()>()).await
            })
        };

        tokio::task::yield_now().await;
        host.uevent("1-2", &managed);

        assert!(waiter.await.unwrap());
        assert!(host.is_bound("1-2"));
    }

    #[tokio::test]
    async fn wait_is_interrupted_by_cancel() {
        let host = UsbHost::new(RecordingBridge::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        let ok = host
            .wait_until_bound("9-9", async {
                let _ = rx.await;
            })
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn duplicate_uevent_does_not_rebind() {
        let host = UsbHost::new(RecordingBridge::default());
        let managed: HashSet<String> = ["1-2".to_string()].into_iter().collect();
        host.uevent("1-2", &managed);
        host.uevent("1-2", &managed);
        assert_eq!(host.bridge.bound.lock().unwrap().len(), 1);
    }
}
