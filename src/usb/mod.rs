//! USB transport abstraction: device/interface/endpoint descriptors and the
//! closed status taxonomy every backend (§4.C) translates its own errors
//! into. Grounded on the teacher's `usb.rs` (descriptor types, `num_enum`
//! use) and `backend/mod.rs` (the `BackendDevice`/`BackendHandle` split),
//! generalized from protocol-analysis capture to bulk/control data
//! transport.

pub mod backend;
pub mod device;
pub mod enumerator;
pub mod request;

use bytemuck_derive::{Pod, Zeroable};
use derive_more::Display;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Closed taxonomy of outcomes a transport call can report. This is a
/// plain value type, not an error: callers match on it and only lift it to
/// an `anyhow::Error` once a failure is irrecoverable for the operation in
/// progress.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(i32)]
pub enum UsbStatus {
    Success = 0,
    Io = -1,
    InvalidParam = -2,
    Access = -3,
    NoDevice = -4,
    NotFound = -5,
    Busy = -6,
    Timeout = -7,
    Overflow = -8,
    Pipe = -9,
    Interrupted = -10,
    NoMem = -11,
    NotSupported = -12,
    #[default]
    Other = -99,
}

impl UsbStatus {
    pub fn is_success(self) -> bool {
        self == UsbStatus::Success
    }

    pub fn into_result(self) -> Result<(), UsbStatus> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

/// Information about a device as returned by enumeration, before it is
/// opened. Enumeration produces one record per interface (`mi` set to that
/// interface's number); records for the same physical device share
/// `unique_id`, matching the original driver's `usb_device_info` (where
/// `unique_id` is a platform device name/path, e.g. the Android backend's
/// `usb_device_get_name()`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub bus_number: u8,
    pub device_address: u8,
    /// Stable device path/name shared by every interface record of the
    /// same physical device.
    pub unique_id: String,
    /// USB spec release number in BCD (e.g. `0x0200` for USB 2.00).
    pub usb_version_bcd: u16,
    /// Device descriptor's `bDeviceClass`.
    pub device_class: u8,
    /// Interface number this record describes.
    pub mi: u8,
}

/// Which of a UVC-class device's interfaces a descriptor describes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum InterfaceSubclass {
    #[default]
    Any = 0,
    Control = 1,
    Streaming = 2,
    /// Vendor-specific hardware-monitor channel.
    Hwm = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum EndpointTransferType {
    #[default]
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub transfer_type: EndpointTransferType,
    pub max_packet_size: u16,
}

impl Endpoint {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub subclass: InterfaceSubclass,
    pub endpoints: Vec<Endpoint>,
    /// Interface numbers an Interface Association Descriptor groups under
    /// this one (e.g. the UVC streaming interfaces a VideoControl
    /// interface owns). Empty if this interface is not an IAD owner.
    pub associated_interfaces: Vec<u8>,
}

impl Interface {
    pub fn endpoint_for(&self, in_direction: bool, transfer_type: EndpointTransferType) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.is_in() == in_direction && ep.transfer_type == transfer_type)
    }
}

/// Minimal descriptor surface an open device exposes once claimed: its
/// interfaces, grouped the way an Interface Association Descriptor (IAD)
/// groups a UVC control interface with its streaming interfaces.
#[derive(Clone, Debug, Default)]
pub struct UsbDescriptor {
    pub interfaces: Vec<Interface>,
}

impl UsbDescriptor {
    pub fn interfaces_of(&self, subclass: InterfaceSubclass) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter().filter(move |i| {
            subclass == InterfaceSubclass::Any || i.subclass == subclass
        })
    }
}

/// Fill in `associated_interfaces` for every `Control` interface in `list`,
/// given interfaces ordered by ascending `interface_number` as they appear
/// in the device's configuration descriptor. An IAD groups a VideoControl
/// interface with the VideoStreaming interfaces that immediately follow it
/// (up to the next Control interface or the end of the list) — this is how
/// UVC devices lay out their IADs, and how the original driver resolves
/// "associated interfaces" without a dedicated IAD table.
pub fn group_associated_interfaces(list: &mut [Interface]) {
    let mut owner: Option<usize> = None;
    for idx in 0..list.len() {
        match list[idx].subclass {
            InterfaceSubclass::Control => {
                list[idx].associated_interfaces.clear();
                owner = Some(idx);
            }
            InterfaceSubclass::Streaming => {
                if let Some(owner_idx) = owner {
                    let streaming_number = list[idx].interface_number;
                    list[owner_idx].associated_interfaces.push(streaming_number);
                }
            }
            _ => owner = None,
        }
    }
}

/// Raw little-endian GET_VERSION/DFU-style status record, `Pod` so it can
/// be decoded directly out of a control-transfer buffer without manual
/// field-by-field parsing.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct RawStatusWord(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_i32() {
        let raw: i32 = UsbStatus::Timeout.into();
        let back = UsbStatus::from(raw);
        assert_eq!(back, UsbStatus::Timeout);
    }

    #[test]
    fn unknown_code_maps_to_other() {
        let back = UsbStatus::from(12345);
        assert_eq!(back, UsbStatus::Other);
    }

    #[test]
    fn endpoint_for_matches_direction_and_type() {
        let iface = Interface {
            interface_number: 1,
            alt_setting: 0,
            subclass: InterfaceSubclass::Streaming,
            endpoints: vec![
                Endpoint { address: 0x81, transfer_type: EndpointTransferType::Bulk, max_packet_size: 512 },
                Endpoint { address: 0x02, transfer_type: EndpointTransferType::Bulk, max_packet_size: 512 },
            ],
            associated_interfaces: Vec::new(),
        };
        let ep = iface.endpoint_for(true, EndpointTransferType::Bulk).unwrap();
        assert_eq!(ep.address, 0x81);
    }

    fn bare_interface(interface_number: u8, subclass: InterfaceSubclass) -> Interface {
        Interface {
            interface_number,
            alt_setting: 0,
            subclass,
            endpoints: Vec::new(),
            associated_interfaces: Vec::new(),
        }
    }

    #[test]
    fn iad_groups_streaming_interfaces_under_control() {
        let mut list = vec![
            bare_interface(0, InterfaceSubclass::Control),
            bare_interface(1, InterfaceSubclass::Streaming),
            bare_interface(2, InterfaceSubclass::Streaming),
            bare_interface(3, InterfaceSubclass::Hwm),
        ];
        group_associated_interfaces(&mut list);
        assert_eq!(list[0].associated_interfaces, vec![1, 2]);
        assert!(list[3].associated_interfaces.is_empty());
    }
}
