//! Device discovery facade. Grounded on the teacher's `backend::scan`
//! (`nusb::list_devices().await?` filtered by supported VID/PID) and
//! generalized to dispatch to whichever of the three backends (§4.C) the
//! caller selects, rather than a single fixed transport.

use anyhow::{bail, Result};

use super::backend::BackendKind;
use super::device::UsbDevice;
use super::UsbDeviceInfo;

/// Enumerates devices through a chosen backend and hands out device
/// handles that haven't been opened yet.
pub struct Enumerator {
    backend: BackendKind,
}

impl Enumerator {
    pub fn new(backend: BackendKind) -> Self {
        Enumerator { backend }
    }

    /// List every device visible to this backend matching `vendor_id` (and
    /// `product_id`, if given).
    pub fn query_devices_info(
        &self,
        vendor_id: u16,
        product_id: Option<u16>,
    ) -> Result<Vec<UsbDeviceInfo>> {
        let all = self.backend.list_devices()?;
        Ok(all
            .into_iter()
            .filter(|d| d.vendor_id == vendor_id)
            .filter(|d| product_id.map(|pid| pid == d.product_id).unwrap_or(true))
            .collect())
    }

    /// Open the device matching `info` exactly (bus/address), or the
    /// first matching its serial number if `info.serial_number` is set and
    /// the exact bus/address pair is stale (the device re-enumerated after
    /// a reset, as happens mid-DFU).
    pub fn create_usb_device(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDevice>> {
        self.backend.open_device(info)
    }

    /// Whether a device with the given serial number is currently present,
    /// used by the firmware-update CLI's recovery-mode wait loop.
    pub fn is_device_connected(&self, vendor_id: u16, product_id: u16, serial_number: &str) -> Result<bool> {
        let devices = self.query_devices_info(vendor_id, Some(product_id))?;
        Ok(devices
            .iter()
            .any(|d| d.serial_number.as_deref() == Some(serial_number)))
    }

    pub fn wait_for_serial(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_number: &str,
        timeout: std::time::Duration,
    ) -> Result<UsbDeviceInfo> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let devices = self.query_devices_info(vendor_id, Some(product_id))?;
            if let Some(found) = devices
                .into_iter()
                .find(|d| d.serial_number.as_deref() == Some(serial_number))
            {
                return Ok(found);
            }
            if std::time::Instant::now() >= deadline {
                bail!(
                    "device {:04x}:{:04x} serial {} did not reappear within {:?}",
                    vendor_id, product_id, serial_number, timeout
                );
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}

