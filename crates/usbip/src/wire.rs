//! USB/IP wire codec: big-endian 32-bit fields, opcodes following the
//! Linux `usbip-core` convention (§4.4, §6). This is a minimal subset —
//! enough control-phase and URB-header fields to drive the
//! "wait-until-device-appears" import flow and multiplex URBs by
//! `seqnum`, not a full reimplementation of usbip-core.

use std::io;

pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;

pub const ST_OK: u32 = 0;
pub const ST_NA: u32 = 1;

pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

const BUSID_LEN: usize = 32;
const PATH_LEN: usize = 256;

/// Fixed wire size of a [`UsbDeviceInfo`], for callers that need to read
/// an `OP_REP_IMPORT` device descriptor off a socket before they can
/// hand the whole frame to [`OpRepImport::decode`].
pub const DEVICE_INFO_LEN: usize = BUSID_LEN + PATH_LEN + 4 + 4 + 4 + 2 + 2 + 2 + 6;

fn io_eof(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("short read: {what}"))
}

fn take<'a>(buf: &mut &'a [u8], n: usize, what: &str) -> io::Result<&'a [u8]> {
    if buf.len() < n {
        return Err(io_eof(what));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u16(buf: &mut &[u8], what: &str) -> io::Result<u16> {
    Ok(u16::from_be_bytes(take(buf, 2, what)?.try_into().unwrap()))
}

fn read_u32(buf: &mut &[u8], what: &str) -> io::Result<u32> {
    Ok(u32::from_be_bytes(take(buf, 4, what)?.try_into().unwrap()))
}

fn read_i32(buf: &mut &[u8], what: &str) -> io::Result<i32> {
    Ok(i32::from_be_bytes(take(buf, 4, what)?.try_into().unwrap()))
}

fn fixed_bytes(s: &str, len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    v[..n].copy_from_slice(&bytes[..n]);
    v
}

fn read_cstr(buf: &mut &[u8], len: usize, what: &str) -> io::Result<String> {
    let raw = take(buf, len, what)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// USB device speed, carried in `OP_REP_IMPORT` and used to select the
/// VHCI controller port range (§4.5: High-Speed -> [0,7], SuperSpeed ->
/// [8,15]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    fn from_wire(v: u32) -> Self {
        match v {
            1 => UsbSpeed::Full,
            2 => UsbSpeed::High,
            5 => UsbSpeed::Super,
            _ => UsbSpeed::Low,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            UsbSpeed::Low => 0,
            UsbSpeed::Full => 1,
            UsbSpeed::High => 2,
            UsbSpeed::Super => 5,
        }
    }

    /// The VHCI controller port range this speed attaches into.
    pub fn port_range(self) -> std::ops::RangeInclusive<u8> {
        match self {
            UsbSpeed::Super => 8..=15,
            _ => 0..=7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsbDeviceInfo {
    pub busid: String,
    pub path: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: UsbSpeed,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDeviceInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&fixed_bytes(&self.busid, BUSID_LEN));
        out.extend_from_slice(&fixed_bytes(&self.path, PATH_LEN));
        out.extend_from_slice(&self.busnum.to_be_bytes());
        out.extend_from_slice(&self.devnum.to_be_bytes());
        out.extend_from_slice(&self.speed.to_wire().to_be_bytes());
        out.extend_from_slice(&self.id_vendor.to_be_bytes());
        out.extend_from_slice(&self.id_product.to_be_bytes());
        out.extend_from_slice(&self.bcd_device.to_be_bytes());
        out.push(self.device_class);
        out.push(self.device_subclass);
        out.push(self.device_protocol);
        out.push(self.configuration_value);
        out.push(self.num_configurations);
        out.push(self.num_interfaces);
    }

    pub fn decode(buf: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            busid: read_cstr(buf, BUSID_LEN, "busid")?,
            path: read_cstr(buf, PATH_LEN, "path")?,
            busnum: read_u32(buf, "busnum")?,
            devnum: read_u32(buf, "devnum")?,
            speed: UsbSpeed::from_wire(read_u32(buf, "speed")?),
            id_vendor: read_u16(buf, "idVendor")?,
            id_product: read_u16(buf, "idProduct")?,
            bcd_device: read_u16(buf, "bcdDevice")?,
            device_class: *take(buf, 1, "bDeviceClass")?.first().unwrap(),
            device_subclass: *take(buf, 1, "bDeviceSubClass")?.first().unwrap(),
            device_protocol: *take(buf, 1, "bDeviceProtocol")?.first().unwrap(),
            configuration_value: *take(buf, 1, "bConfigurationValue")?.first().unwrap(),
            num_configurations: *take(buf, 1, "bNumConfigurations")?.first().unwrap(),
            num_interfaces: *take(buf, 1, "bNumInterfaces")?.first().unwrap(),
        })
    }
}

/// `OP_REQ_IMPORT`: control-phase request to import a device by bus id.
pub struct OpReqImport {
    pub busid: String,
}

impl OpReqImport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + BUSID_LEN);
        out.extend_from_slice(&USBIP_VERSION.to_be_bytes());
        out.extend_from_slice(&OP_REQ_IMPORT.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&fixed_bytes(&self.busid, BUSID_LEN));
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let _version = read_u16(&mut buf, "version")?;
        let code = read_u16(&mut buf, "code")?;
        if code != OP_REQ_IMPORT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected OP_REQ_IMPORT, got {code:#06x}"),
            ));
        }
        let _status = read_u32(&mut buf, "status")?;
        let busid = read_cstr(&mut buf, BUSID_LEN, "busid")?;
        Ok(Self { busid })
    }
}

/// `OP_REP_IMPORT`: either the imported device's descriptor, or
/// `ST_NA` if the hub's spec-mandated deviation doesn't apply (closed
/// tunnel before a device appeared).
pub enum OpRepImport {
    Ok(UsbDeviceInfo),
    NotAvailable,
}

impl OpRepImport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&USBIP_VERSION.to_be_bytes());
        out.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
        match self {
            OpRepImport::Ok(info) => {
                out.extend_from_slice(&ST_OK.to_be_bytes());
                info.encode(&mut out);
            }
            OpRepImport::NotAvailable => {
                out.extend_from_slice(&ST_NA.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let _version = read_u16(&mut buf, "version")?;
        let code = read_u16(&mut buf, "code")?;
        if code != OP_REP_IMPORT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected OP_REP_IMPORT, got {code:#06x}"),
            ));
        }
        let status = read_u32(&mut buf, "status")?;
        if status != ST_OK {
            return Ok(OpRepImport::NotAvailable);
        }
        Ok(OpRepImport::Ok(UsbDeviceInfo::decode(&mut buf)?))
    }
}

/// Common header shared by `USBIP_CMD_SUBMIT`/`USBIP_RET_SUBMIT`/
/// `USBIP_CMD_UNLINK`/`USBIP_RET_UNLINK`. Concurrent URBs on one device
/// are multiplexed by `seqnum`.
#[derive(Debug, Clone, Copy)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UrbHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&self.devid.to_be_bytes());
        out.extend_from_slice(&self.direction.to_be_bytes());
        out.extend_from_slice(&self.ep.to_be_bytes());
    }

    pub fn decode(buf: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            command: read_u32(buf, "command")?,
            seqnum: read_u32(buf, "seqnum")?,
            devid: read_u32(buf, "devid")?,
            direction: read_u32(buf, "direction")?,
            ep: read_u32(buf, "ep")?,
        })
    }
}

pub struct CmdSubmit {
    pub header: UrbHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub setup: [u8; 8],
    pub payload: Vec<u8>,
}

impl CmdSubmit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.payload.len());
        self.header.encode(&mut out);
        out.extend_from_slice(&self.transfer_flags.to_be_bytes());
        out.extend_from_slice(&self.transfer_buffer_length.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes()); // start_frame
        out.extend_from_slice(&0u32.to_be_bytes()); // number_of_packets
        out.extend_from_slice(&0u32.to_be_bytes()); // interval
        out.extend_from_slice(&self.setup);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let header = UrbHeader::decode(&mut buf)?;
        let transfer_flags = read_u32(&mut buf, "transfer_flags")?;
        let transfer_buffer_length = read_u32(&mut buf, "transfer_buffer_length")?;
        let _start_frame = read_i32(&mut buf, "start_frame")?;
        let _number_of_packets = read_u32(&mut buf, "number_of_packets")?;
        let _interval = read_u32(&mut buf, "interval")?;
        let setup: [u8; 8] = take(&mut buf, 8, "setup")?.try_into().unwrap();
        Ok(Self {
            header,
            transfer_flags,
            transfer_buffer_length,
            setup,
            payload: buf.to_vec(),
        })
    }
}

pub struct RetSubmit {
    pub header: UrbHeader,
    pub status: i32,
    pub payload: Vec<u8>,
}

impl RetSubmit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.payload.len());
        self.header.encode(&mut out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes()); // start_frame
        out.extend_from_slice(&0u32.to_be_bytes()); // number_of_packets
        out.extend_from_slice(&0u32.to_be_bytes()); // error_count
        out.extend_from_slice(&[0u8; 8]); // setup (unused on replies)
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let header = UrbHeader::decode(&mut buf)?;
        let status = read_i32(&mut buf, "status")?;
        let actual_length = read_u32(&mut buf, "actual_length")? as usize;
        let _start_frame = read_i32(&mut buf, "start_frame")?;
        let _number_of_packets = read_u32(&mut buf, "number_of_packets")?;
        let _error_count = read_u32(&mut buf, "error_count")?;
        let _setup = take(&mut buf, 8, "setup")?;
        let payload_len = actual_length.min(buf.len());
        let payload = take(&mut buf, payload_len, "payload")?.to_vec();
        Ok(Self {
            header,
            status,
            payload,
        })
    }
}

/// `USBIP_CMD_UNLINK`: references the original `seqnum` of the URB to
/// cancel. Completes when that URB's `RetSubmit` (or a synthesized
/// cancellation reply) is emitted.
pub struct CmdUnlink {
    pub header: UrbHeader,
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        self.header.encode(&mut out);
        out.extend_from_slice(&self.unlink_seqnum.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]); // padding to match CMD_SUBMIT's tail shape
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let header = UrbHeader::decode(&mut buf)?;
        let unlink_seqnum = read_u32(&mut buf, "unlink_seqnum")?;
        Ok(Self {
            header,
            unlink_seqnum,
        })
    }
}

pub struct RetUnlink {
    pub header: UrbHeader,
    pub status: i32,
}

impl RetUnlink {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        self.header.encode(&mut out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]);
        out
    }

    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let header = UrbHeader::decode(&mut buf)?;
        let status = read_i32(&mut buf, "status")?;
        Ok(Self { header, status })
    }
}
