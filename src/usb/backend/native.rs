//! "OS-native" backend: `nusb`'s cross-platform async transfer API
//! (WinUSB on Windows, usbfs on Linux, IOKit on macOS). This is the
//! teacher's own transport crate, used the same way `backend/cynthion.rs`
//! uses it — `device_info.open()`, `claim_interface`, and
//! `spawn(move || block_on(...))` to run async work from a synchronous
//! trait method.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_lite::future::block_on;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, RequestBuffer};
use nusb::{DeviceInfo, Interface as NusbInterface};

use crate::concurrency::Dispatcher;
use crate::usb::device::{UsbDevice, UsbMessenger};
use crate::usb::request::UsbRequestCallback;
use crate::usb::{
    group_associated_interfaces, Endpoint, EndpointTransferType, Interface, InterfaceSubclass,
    UsbDescriptor, UsbDeviceInfo, UsbStatus,
};

const DISPATCHER_CAPACITY: usize = 16;

pub fn list_devices() -> Result<Vec<UsbDeviceInfo>> {
    let devices = block_on(nusb::list_devices()).context("listing devices")?;
    Ok(devices.flat_map(|d| device_info_records(&d)).collect())
}

/// One `UsbDeviceInfo` record per real interface (`mi` set to that
/// interface's number), suppressing VideoStreaming sub-interfaces (they're
/// reached through a VideoControl interface's `associated_interfaces`, not
/// enumerated on their own) and suppressing a `0xFE` "DFU ghost" interface
/// when the device also exposes a non-DFU interface — a genuine
/// recovery-mode device, which presents *only* a DFU-class interface, is
/// kept.
fn device_info_records(d: &DeviceInfo) -> Vec<UsbDeviceInfo> {
    let classified: Vec<(u8, u8, u8)> = d
        .interfaces()
        .map(|group| (group.interface_number(), group.class(), group.subclass()))
        .collect();
    let has_non_dfu = classified.iter().any(|&(_, class, _)| class != 0xfe);
    let unique_id = format!("bus{}-dev{}", d.bus_number(), d.device_address());
    let bcd = d.device_version();
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
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                serial_number: d.serial_number().map(str::to_owned),
                bus_number: d.bus_number(),
                device_address: d.device_address(),
                unique_id: unique_id.clone(),
                usb_version_bcd: bcd,
                device_class: class,
                mi,
            })
        })
        .collect()
}

pub fn open_device(info: &UsbDeviceInfo) -> Result<Box<dyn UsbDevice>> {
    let devices = block_on(nusb::list_devices()).context("listing devices")?;
    let found = devices
        .into_iter()
        .find(|d| d.bus_number() == info.bus_number && d.device_address() == info.device_address)
        .with_context(|| format!("device {info:?} no longer present"))?;
    Ok(Box::new(NativeDevice {
        device_info: found,
        info: info.clone(),
    }))
}

#[derive(Clone)]
struct NativeDevice {
    device_info: DeviceInfo,
    info: UsbDeviceInfo,
}

impl UsbDevice for NativeDevice {
    fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    fn open(&self) -> Result<Box<dyn UsbMessenger>, anyhow::Error> {
        let device = block_on(self.device_info.open()).context("opening device")?;
        let descriptor = read_descriptor(&self.device_info);
        // Claim every interface named in the descriptor up front; UVC
        // streaming alt-settings are chosen later via `set_alt_setting`.
        let mut interfaces = Vec::new();
        for iface in &descriptor.interfaces {
            if interfaces.iter().any(|(n, _): &(u8, NusbInterface)| *n == iface.interface_number) {
                continue;
            }
            let claimed = block_on(device.claim_interface(iface.interface_number))
                .with_context(|| format!("claiming interface {}", iface.interface_number))?;
            interfaces.push((iface.interface_number, claimed));
        }
        let dispatcher = Arc::new(Dispatcher::new(DISPATCHER_CAPACITY));
        dispatcher.start();
        Ok(Box::new(NativeMessenger {
            interfaces: Arc::new(interfaces),
            descriptor,
            dispatcher,
        }))
    }

    fn duplicate(&self) -> Box<dyn UsbDevice> {
        Box::new(self.clone())
    }
}

fn read_descriptor(info: &DeviceInfo) -> UsbDescriptor {
    let mut interfaces: Vec<Interface> = info
        .interfaces()
        .map(|group| {
            // UVC VideoControl and VideoStreaming interfaces share class
            // 0x0e; only the subclass byte tells them apart.
            let subclass = match (group.class(), group.subclass()) {
                (0x0e, 0x01) => InterfaceSubclass::Control,
                (0x0e, 0x02) => InterfaceSubclass::Streaming,
                (0xff, _) => InterfaceSubclass::Hwm,
                _ => InterfaceSubclass::Any,
            };
            Interface {
                interface_number: group.interface_number(),
                alt_setting: 0,
                subclass,
                // nusb's `InterfaceInfo` doesn't carry endpoint descriptors
                // before the interface is claimed; populated endpoints come
                // from the UVC streaming-interface negotiation instead.
                endpoints: Vec::new(),
                associated_interfaces: Vec::new(),
            }
        })
        .collect();
    group_associated_interfaces(&mut interfaces);
    UsbDescriptor { interfaces }
}

struct NativeMessenger {
    interfaces: Arc<Vec<(u8, NusbInterface)>>,
    descriptor: UsbDescriptor,
    dispatcher: Arc<Dispatcher>,
}

impl NativeMessenger {
    fn interface_handle(&self, interface_number: u8) -> Option<&NusbInterface> {
        self.interfaces
            .iter()
            .find(|(n, _)| *n == interface_number)
            .map(|(_, i)| i)
    }

    fn any_interface(&self) -> Result<NusbInterface, UsbStatus> {
        self.interfaces.first().map(|(_, i)| i.clone()).ok_or(UsbStatus::NotFound)
    }
}

fn map_nusb_error(e: nusb::transfer::TransferError) -> UsbStatus {
    use nusb::transfer::TransferError::*;
    match e {
        Cancelled => UsbStatus::Interrupted,
        Stall => UsbStatus::Pipe,
        Disconnected => UsbStatus::NoDevice,
        Fault => UsbStatus::Io,
        _ => UsbStatus::Other,
    }
}

#[async_trait]
impl UsbMessenger for NativeMessenger {
    fn descriptor(&self) -> &UsbDescriptor {
        &self.descriptor
    }

    fn claim_interface(&self, interface_number: u8) -> Result<(), UsbStatus> {
        if self.interface_handle(interface_number).is_some() {
            Ok(())
        } else {
            Err(UsbStatus::NotFound)
        }
    }

    fn release_interface(&self, _interface_number: u8) -> Result<(), UsbStatus> {
        // Claimed interfaces are released when `NusbInterface` is dropped;
        // nothing to do explicitly while this messenger is alive.
        Ok(())
    }

    fn set_alt_setting(&self, interface_number: u8, alt_setting: u8) -> Result<(), UsbStatus> {
        let iface = self.interface_handle(interface_number).ok_or(UsbStatus::NotFound)?;
        block_on(iface.set_alt_setting(alt_setting)).map_err(|_| UsbStatus::Io)
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize, UsbStatus> {
        let control_iface = self
            .interfaces
            .first()
            .map(|(_, i)| i)
            .ok_or(UsbStatus::NotFound)?;
        // bmRequestType bits 5-6 select the type, bits 0-1 the recipient;
        // decode both instead of assuming Class/Interface so standard
        // requests (e.g. CLEAR_FEATURE on an endpoint) go out correctly.
        let control_type = match (request_type >> 5) & 0x03 {
            0 => ControlType::Standard,
            2 => ControlType::Vendor,
            _ => ControlType::Class,
        };
        let recipient = match request_type & 0x03 {
            0 => Recipient::Device,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Interface,
        };
        if request_type & 0x80 != 0 {
            let result = block_on(control_iface.control_in(ControlIn {
                control_type,
                recipient,
                request,
                value,
                index,
                length: data.len() as u16,
            }));
            let bytes = result.into_result().map_err(map_nusb_error)?;
            let n = bytes.len().min(data.len());
            data[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        } else {
            let result = block_on(control_iface.control_out(ControlOut {
                control_type,
                recipient,
                request,
                value,
                index,
                data,
            }));
            result.into_result().map_err(map_nusb_error)?;
            Ok(data.len())
        }
    }

    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], _timeout_ms: u32) -> Result<usize, UsbStatus> {
        let iface = self.any_interface()?;
        if endpoint & 0x80 != 0 {
            let completion = block_on(iface.bulk_in(endpoint, RequestBuffer::new(data.len())));
            completion.status.map_err(map_nusb_error)?;
            let n = completion.data.len().min(data.len());
            data[..n].copy_from_slice(&completion.data[..n]);
            Ok(n)
        } else {
            let completion = block_on(iface.bulk_out(endpoint, data.to_vec()));
            completion.status.map_err(map_nusb_error)?;
            Ok(data.len())
        }
    }

    fn reset_endpoint(&self, endpoint: u8, _timeout_ms: u32) -> Result<(), UsbStatus> {
        let iface = self.any_interface()?;
        block_on(iface.clear_halt(endpoint)).map_err(|_| UsbStatus::Io)
    }

    async fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        callback: UsbRequestCallback,
    ) -> Result<(), UsbStatus> {
        let iface = self.any_interface()?;
        // Defer the blocking transfer and the completion callback onto the
        // dispatcher's worker thread instead of running them inline: the
        // UVC engine resubmits the next request from inside this callback,
        // and completing synchronously on the submitting stack would chain
        // every bulk-in completion onto the same call stack for the life
        // of the stream.
        self.dispatcher.invoke(
            move |_timer| {
                let completion = block_on(iface.bulk_in(endpoint, RequestBuffer::new(length)));
                let (actual_length, status) = match completion.status {
                    Ok(()) => (completion.data.len(), UsbStatus::Success),
                    Err(e) => (0, map_nusb_error(e)),
                };
                let mut padded = completion.data;
                padded.resize(length, 0);
                callback.complete(crate::usb::request::UsbRequest {
                    endpoint,
                    buffer: padded,
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
        let iface = self.any_interface()?;
        self.dispatcher.invoke(
            move |_timer| {
                let length = data.len();
                let completion = block_on(iface.bulk_out(endpoint, data.clone()));
                let (actual_length, status) = match completion.status {
                    Ok(()) => (length, UsbStatus::Success),
                    Err(e) => (0, map_nusb_error(e)),
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
    fn nusb_error_mapping_covers_stalls() {
        assert_eq!(map_nusb_error(nusb::transfer::TransferError::Stall), UsbStatus::Pipe);
        assert_eq!(map_nusb_error(nusb::transfer::TransferError::Disconnected), UsbStatus::NoDevice);
    }
}
