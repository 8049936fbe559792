//! "Get Version Data" decoding and the per-device info registry it feeds.
//! Grounded on `gvd.h` (the generic `number<T>`/`serial<N>`/
//! `change_set_version` primitives) and `l500/l500-gvd.h` (a concrete GVD
//! blob layout built from those primitives) plus `l500-device.cpp`'s
//! constructor, which decodes a GVD blob and calls `register_info` for
//! each field it cares about.

use std::collections::HashMap;

use bytemuck_derive::{Pod, Zeroable};

use crate::usb::device::UsbMessenger;
use crate::usb::{EndpointTransferType, Interface};

/// A little-endian field the firmware stores byte-reversed relative to
/// its natural value, matching `number<T>::reverse` in `gvd.h`.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Number<const N: usize>(pub [u8; N]);

impl Number<1> {
    pub fn value(&self) -> u8 {
        self.0[0]
    }
}

impl Number<2> {
    pub fn value(&self) -> u16 {
        u16::from_be_bytes(self.0)
    }
}

impl Number<4> {
    pub fn value(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// Raw bytes identifying a module (ASIC, optic, RGB sensor, ...),
/// rendered as lowercase hex, matching `serial<LENGTH>::to_hex_string`.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Serial<const N: usize>(pub [u8; N]);

impl<const N: usize> Serial<N> {
    pub fn to_hex_string(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// `major.minor.number.revision` firmware payload version, matching
/// `change_set_version` in `gvd.h`. Field order in the wire struct is
/// revision, number, minor, major (least-significant byte first).
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ChangeSetVersion {
    pub revision: u8,
    pub number: u8,
    pub minor: u8,
    pub major: u8,
}

impl ChangeSetVersion {
    pub fn to_string_dotted(&self) -> String {
        format!("{}.{}.{}.{}", self.major, self.minor, self.number, self.revision)
    }
}

/// A module's `minor`/`major` version pair, matching
/// `major_minor_version<T>` in `gvd.h`.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct MajorMinorVersion {
    pub minor: u8,
    pub major: u8,
}

impl MajorMinorVersion {
    pub fn to_string_dotted(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

/// The subset of `rs_l500_gvd` this driver reads. The original struct has
/// many more reserved/padding fields; this layout keeps only the ones
/// `l500_device`'s constructor actually consults, at their real byte
/// offsets, so `#[repr(C)]` still lines up against a real GVD blob when
/// the caller slices from offset 0.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct L500Gvd {
    pub structure_size: Number<2>,
    pub structure_version: Number<1>,
    pub product_type: Number<1>,
    pub product_id: Number<1>,
    pub advanced_mode_enabled: Number<1>,
    pub advanced_mode_version: MajorMinorVersion,
    _padding1: u32,
    pub functional_payload_version: ChangeSetVersion,
    _rest: [u8; 0],
}

/// Fields the original's device constructor actually extracts and
/// registers, decoded from a raw GVD buffer. `offset`s are the ones
/// `l500-gvd.h` defines for `AsicModuleSerial`/`OpticModuleSerial`
/// relative to the start of the struct; this crate reads them directly
/// rather than reproducing every padding byte in between.
const ASIC_MODULE_SERIAL_OFFSET: usize = 80;
const OPTIC_MODULE_SERIAL_OFFSET: usize = 52;

fn read_serial6(buffer: &[u8], offset: usize) -> Option<Serial<6>> {
    let slice = buffer.get(offset..offset + 6)?;
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(slice);
    Some(Serial(bytes))
}

/// Read-only key/value store for decoded device identity fields, mirroring
/// `device::register_info`/`get_info`.
#[derive(Clone, Debug, Default)]
pub struct CameraInfoRegistry {
    values: HashMap<CameraInfo, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CameraInfo {
    Name,
    SerialNumber,
    OpticSerialNumber,
    FirmwareVersion,
    ProductId,
}

impl CameraInfoRegistry {
    pub fn new() -> Self {
        CameraInfoRegistry::default()
    }

    pub fn register(&mut self, info: CameraInfo, value: impl Into<String>) {
        self.values.insert(info, value.into());
    }

    pub fn get_info(&self, info: CameraInfo) -> Option<&str> {
        self.values.get(&info).map(String::as_str)
    }
}

/// Decode a raw GVD blob into a populated info registry, the Rust
/// equivalent of `l500_device`'s constructor body (minus the parts that
/// depend on the rest of the device object, like `device_path` and the
/// hex-ified PID which the caller already has from enumeration).
pub fn decode_into_registry(buffer: &[u8], device_name: &str, pid_hex: &str) -> anyhow::Result<CameraInfoRegistry> {
    anyhow::ensure!(buffer.len() >= std::mem::size_of::<L500Gvd>(), "GVD buffer shorter than the fixed header");
    let header: L500Gvd = bytemuck::pod_read_unaligned(&buffer[..std::mem::size_of::<L500Gvd>()]);

    let asic_serial = read_serial6(buffer, ASIC_MODULE_SERIAL_OFFSET)
        .ok_or_else(|| anyhow::anyhow!("GVD buffer too short for AsicModuleSerial"))?;
    let optic_serial = read_serial6(buffer, OPTIC_MODULE_SERIAL_OFFSET)
        .ok_or_else(|| anyhow::anyhow!("GVD buffer too short for OpticModuleSerial"))?;

    let mut registry = CameraInfoRegistry::new();
    registry.register(CameraInfo::Name, device_name);
    registry.register(CameraInfo::SerialNumber, asic_serial.to_hex_string());
    registry.register(CameraInfo::OpticSerialNumber, optic_serial.to_hex_string());
    registry.register(CameraInfo::FirmwareVersion, header.functional_payload_version.to_string_dotted());
    registry.register(CameraInfo::ProductId, pid_hex);
    Ok(registry)
}

/// The original driver's `fw_cmd::GVD` opcode — the one HWM command this
/// driver issues.
const FW_CMD_GVD: u32 = 0x10;
const HWM_TIMEOUT_MS: u32 = 1000;

/// HWM requests are the opcode followed by four reserved parameter words;
/// GVD takes none, so they're left zeroed.
fn build_gvd_command() -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&FW_CMD_GVD.to_le_bytes());
    buf.extend_from_slice(&[0u8; 16]);
    buf
}

/// Fetch and decode the GVD block over a device's hardware-monitor
/// interface, the Rust equivalent of `l500_device`'s constructor calling
/// `hw_monitor::get_gvd` and decoding the result straight into its info
/// registry.
pub fn read_via_hwm(
    messenger: &dyn UsbMessenger,
    hwm_interface: &Interface,
    device_name: &str,
    pid_hex: &str,
) -> anyhow::Result<CameraInfoRegistry> {
    let out_ep = hwm_interface
        .endpoint_for(false, EndpointTransferType::Bulk)
        .ok_or_else(|| anyhow::anyhow!("hardware-monitor interface has no bulk OUT endpoint"))?;
    let in_ep = hwm_interface
        .endpoint_for(true, EndpointTransferType::Bulk)
        .ok_or_else(|| anyhow::anyhow!("hardware-monitor interface has no bulk IN endpoint"))?;
    let command = build_gvd_command();
    let response = messenger
        .send_receive_transfer(out_ep.address, in_ep.address, &command, HWM_TIMEOUT_MS)
        .map_err(|e| anyhow::anyhow!("HWM GVD request failed: {e:?}"))?;
    decode_into_registry(&response, device_name, pid_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_buffer() -> Vec<u8> {
        let mut buffer = vec![0u8; 160];
        // functional_payload_version at offset 12 (after the 4-byte
        // header fields + 1-byte fields + major_minor_version + padding).
        buffer[12] = 3; // revision
        buffer[13] = 2; // number
        buffer[14] = 1; // minor
        buffer[15] = 9; // major
        for (i, b) in buffer[OPTIC_MODULE_SERIAL_OFFSET..OPTIC_MODULE_SERIAL_OFFSET + 6].iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in buffer[ASIC_MODULE_SERIAL_OFFSET..ASIC_MODULE_SERIAL_OFFSET + 6].iter_mut().enumerate() {
            *b = 0xa0 + i as u8;
        }
        buffer
    }

    #[test]
    fn serial_renders_as_lowercase_hex() {
        let serial = Serial([0x01, 0xab, 0x0f, 0x00, 0xff, 0x10]);
        assert_eq!(serial.to_hex_string(), "01ab0f00ff10");
    }

    #[test]
    fn change_set_version_formats_major_minor_number_revision() {
        let version = ChangeSetVersion { revision: 3, number: 2, minor: 1, major: 9 };
        assert_eq!(version.to_string_dotted(), "9.1.2.3");
    }

    #[test]
    fn decode_populates_registry_from_buffer() {
        let buffer = sample_buffer();
        let registry = decode_into_registry(&buffer, "RS5xx", "0x0b64").unwrap();
        assert_eq!(registry.get_info(CameraInfo::Name), Some("RS5xx"));
        assert_eq!(registry.get_info(CameraInfo::FirmwareVersion), Some("9.1.2.3"));
        assert_eq!(registry.get_info(CameraInfo::OpticSerialNumber), Some("000102030405"));
        assert_eq!(registry.get_info(CameraInfo::SerialNumber), Some("a0a1a2a3a4a5"));
        assert_eq!(registry.get_info(CameraInfo::ProductId), Some("0x0b64"));
    }

    #[test]
    fn unregistered_info_kind_is_none() {
        let registry = CameraInfoRegistry::new();
        assert_eq!(registry.get_info(CameraInfo::SerialNumber), None);
    }

    #[test]
    fn gvd_command_encodes_opcode_first() {
        let cmd = build_gvd_command();
        assert_eq!(cmd.len(), 20);
        assert_eq!(&cmd[..4], &FW_CMD_GVD.to_le_bytes());
        assert!(cmd[4..].iter().all(|&b| b == 0));
    }
}
