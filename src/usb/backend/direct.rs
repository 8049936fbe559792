//! "Direct userland" backend: libusb-style access via `rusb`. `rusb`'s
//! safe API only exposes blocking transfers, so asynchronous submission is
//! built the same way the rest of this crate builds async-from-threads:
//! a private `Dispatcher` runs the blocking call and invokes the
//! completion callback when it returns. Grounded on `rUVC`'s
//! `rusb::{Context, Device, DeviceHandle}` usage (claim/configure/control)
//! and on this crate's own `concurrency::Dispatcher`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::concurrency::Dispatcher;
use crate::usb::device::{UsbDevice, UsbMessenger};
use crate::usb::request::UsbRequestCallback;
use crate::usb::{
    group_associated_interfaces, Endpoint, EndpointTransferType, Interface, InterfaceSubclass,
    UsbDescriptor, UsbDeviceInfo, UsbStatus,
};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const BULK_TIMEOUT: Duration = Duration::from_millis(2000);

pub fn list_devices() -> Result<Vec<UsbDeviceInfo>> {
    let ctx = Context::new().context("opening libusb context")?;
    let mut out = Vec::new();
    for device in ctx.devices().context("listing devices")?.iter() {
        let Ok(desc) = device.device_descriptor() else { continue };
        out.extend(device_info_records(&device, &desc));
    }
    Ok(out)
}

/// One `UsbDeviceInfo` record per real interface, `mi` set to that
/// interface's number. A VideoStreaming sub-interface (shares class 0x0e
/// with VideoControl, distinguished only by subclass) is not enumerated
/// on its own; a `0xFE` DFU interface is suppressed as a ghost entry only
/// when the device also has a non-DFU interface, so a genuine
/// recovery-mode device (DFU-only) still enumerates.
fn device_info_records(device: &Device<Context>, desc: &rusb::DeviceDescriptor) -> Vec<UsbDeviceInfo> {
    let Ok(config) = device.active_config_descriptor() else {
        return Vec::new();
    };
    let classified: Vec<(u8, u8, u8)> = config
        .interfaces()
        .filter_map(|iface| {
            iface
                .descriptors()
                .next()
                .map(|alt| (alt.interface_number(), alt.class_code(), alt.sub_class_code()))
        })
        .collect();
    let has_non_dfu = classified.iter().any(|&(_, class, _)| class != 0xfe);
    let serial = device
        .open()
        .ok()
        .and_then(|h| h.read_serial_number_string_ascii(desc).ok());
    let version = desc.usb_version();
    let usb_version_bcd =
        ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16;
    let unique_id = format!("bus{}-dev{}", device.bus_number(), device.address());
    let mut seen = HashSet::new();
    classified
        .into_iter()
        .filter_map(|(mi, class, subclass)| {
            if class == 0x0e && subclass == 0x02 {
                return None;
            }
            if class == 0xfe && has_non_dfu {
                return None;
            }
            if !seen.insert(mi) {
                return None;
            }
            Some(UsbDeviceInfo {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                serial_number: serial.clone(),
                bus_number: device.bus_number(),
                device_address: device.address(),
                unique_id: unique_id.clone(),
                usb_version_bcd,
                device_class: class,
                mi,
            })
        })
        .collect()
}

pub fn open_device(info: &UsbDeviceInfo) -> Result<Box<dyn UsbDevice>> {
    let ctx = Context::new().context("opening libusb context")?;
    let device = ctx
        .devices()
        .context("listing devices")?
        .iter()
        .find(|d| d.bus_number() == info.bus_number && d.address() == info.device_address)
        .with_context(|| format!("device {info:?} no longer present"))?;
    Ok(Box::new(DirectDevice {
        device,
        info: info.clone(),
    }))
}

#[derive(Clone)]
struct DirectDevice {
    device: Device<Context>,
    info: UsbDeviceInfo,
}

impl UsbDevice for DirectDevice {
    fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    fn open(&self) -> Result<Box<dyn UsbMessenger>, anyhow::Error> {
        let handle = self.device.open().context("opening device handle")?;
        let descriptor = read_descriptor(&self.device)?;
        // Drives libusb's event loop for transfers submitted by the
        // dispatcher below; libusb requires someone to poll it.
        let pump_context = self.device.context().clone();
        let dispatcher = Arc::new(Dispatcher::new(16));
        dispatcher.start();
        std::thread::spawn(move || loop {
            if pump_context.handle_events(Some(Duration::from_millis(200))).is_err() {
                break;
            }
        });
        Ok(Box::new(DirectMessenger {
            handle: Arc::new(handle),
            descriptor,
            dispatcher,
        }))
    }

    fn duplicate(&self) -> Box<dyn UsbDevice> {
        Box::new(self.clone())
    }
}

fn read_descriptor(device: &Device<Context>) -> Result<UsbDescriptor> {
    let config = device.active_config_descriptor().context("reading config descriptor")?;
    let mut interfaces = Vec::new();
    for iface in config.interfaces() {
        for alt in iface.descriptors() {
            // UVC VideoControl and VideoStreaming interfaces share class
            // 0x0e; only the subclass byte tells them apart.
            let subclass = match (alt.class_code(), alt.sub_class_code()) {
                (0x0e, 0x01) => InterfaceSubclass::Control,
                (0x0e, 0x02) => InterfaceSubclass::Streaming,
                (0xff, _) => InterfaceSubclass::Hwm,
                _ => InterfaceSubclass::Any,
            };
            let endpoints = alt
                .endpoint_descriptors()
                .map(|ep| Endpoint {
                    address: ep.address(),
                    transfer_type: match ep.transfer_type() {
                        rusb::TransferType::Control => EndpointTransferType::Control,
                        rusb::TransferType::Isochronous => EndpointTransferType::Isochronous,
                        rusb::TransferType::Bulk => EndpointTransferType::Bulk,
                        rusb::TransferType::Interrupt => EndpointTransferType::Interrupt,
                    },
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            interfaces.push(Interface {
                interface_number: alt.interface_number(),
                alt_setting: alt.setting_number(),
                subclass,
                endpoints,
                associated_interfaces: Vec::new(),
            });
        }
    }
    group_associated_interfaces(&mut interfaces);
    Ok(UsbDescriptor { interfaces })
}

struct DirectMessenger {
    handle: Arc<DeviceHandle<Context>>,
    descriptor: UsbDescriptor,
    dispatcher: Arc<Dispatcher>,
}

fn map_rusb_error(e: rusb::Error) -> UsbStatus {
    match e {
        rusb::Error::Io => UsbStatus::Io,
        rusb::Error::InvalidParam => UsbStatus::InvalidParam,
        rusb::Error::Access => UsbStatus::Access,
        rusb::Error::NoDevice => UsbStatus::NoDevice,
        rusb::Error::NotFound => UsbStatus::NotFound,
        rusb::Error::Busy => UsbStatus::Busy,
        rusb::Error::Timeout => UsbStatus::Timeout,
        rusb::Error::Overflow => UsbStatus::Overflow,
        rusb::Error::Pipe => UsbStatus::Pipe,
        rusb::Error::Interrupted => UsbStatus::Interrupted,
        rusb::Error::NoMem => UsbStatus::NoMem,
        rusb::Error::NotSupported => UsbStatus::NotSupported,
        _ => UsbStatus::Other,
    }
}

#[async_trait]
impl UsbMessenger for DirectMessenger {
    fn descriptor(&self) -> &UsbDescriptor {
        &self.descriptor
    }

    fn claim_interface(&self, interface_number: u8) -> Result<(), UsbStatus> {
        self.handle.claim_interface(interface_number).map_err(map_rusb_error)
    }

    fn release_interface(&self, interface_number: u8) -> Result<(), UsbStatus> {
        self.handle.release_interface(interface_number).map_err(map_rusb_error)
    }

    fn set_alt_setting(&self, interface_number: u8, alt_setting: u8) -> Result<(), UsbStatus> {
        self.handle
            .set_alternate_setting(interface_number, alt_setting)
            .map_err(map_rusb_error)
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize, UsbStatus> {
        if request_type & 0x80 != 0 {
            self.handle
                .read_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
                .map_err(map_rusb_error)
        } else {
            self.handle
                .write_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
                .map_err(map_rusb_error)
        }
    }

    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout_ms: u32) -> Result<usize, UsbStatus> {
        let timeout = Duration::from_millis(timeout_ms as u64);
        if endpoint & 0x80 != 0 {
            self.handle.read_bulk(endpoint, data, timeout).map_err(map_rusb_error)
        } else {
            self.handle.write_bulk(endpoint, data, timeout).map_err(map_rusb_error)
        }
    }

    fn reset_endpoint(&self, endpoint: u8, _timeout_ms: u32) -> Result<(), UsbStatus> {
        self.handle.clear_halt(endpoint).map_err(map_rusb_error)
    }

    async fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        callback: UsbRequestCallback,
    ) -> Result<(), UsbStatus> {
        let handle = self.handle.clone();
        self.dispatcher.invoke(
            move |_timer| {
                let mut buffer = vec![0u8; length];
                let result = handle.read_bulk(endpoint, &mut buffer, BULK_TIMEOUT);
                let (actual_length, status) = match result {
                    Ok(n) => (n, UsbStatus::Success),
                    Err(rusb::Error::Timeout) => (0, UsbStatus::Timeout),
                    Err(e) => (0, map_rusb_error(e)),
                };
                callback.complete(crate::usb::request::UsbRequest {
                    endpoint,
                    buffer,
                    actual_length,
                    status,
                });
            },
            false,
        );
        Ok(())
    }

    async fn submit_bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        callback: UsbRequestCallback,
    ) -> Result<(), UsbStatus> {
        let handle = self.handle.clone();
        self.dispatcher.invoke(
            move |_timer| {
                let result = handle.write_bulk(endpoint, &data, BULK_TIMEOUT);
                let (actual_length, status) = match result {
                    Ok(n) => (n, UsbStatus::Success),
                    Err(rusb::Error::Timeout) => (0, UsbStatus::Timeout),
                    Err(e) => (0, map_rusb_error(e)),
                };
                callback.complete(crate::usb::request::UsbRequest {
                    endpoint,
                    buffer: data,
                    actual_length,
                    status,
                });
            },
            false,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusb_error_mapping_covers_timeouts() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbStatus::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbStatus::NoDevice);
    }
}
