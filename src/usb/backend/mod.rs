//! The three transport backends named in spec.md §4.C: "direct userland"
//! (libusb-style, via `rusb`), "OS-native" (via `nusb`, the teacher's own
//! transport crate), and "usbhost-style" (Android, via `jni`). Grounded on
//! the teacher's own backend-selection pattern (`backend::SUPPORTED_DEVICES`
//! dispatch table in `backend/mod.rs`), generalized from a fixed VID/PID
//! table to an explicit user choice of transport.

pub mod direct;
pub mod native;

#[cfg(target_os = "android")]
pub mod usbhost;

use anyhow::Result;

use super::device::UsbDevice;
use super::UsbDeviceInfo;

/// Which transport implementation to use. The caller (typically the
/// firmware-update CLI or the pipeline's `Config`) picks one; nothing here
/// probes and falls back automatically, since the three transports are not
/// interchangeable on a given host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// libusb-style: a background event-pump thread services completions
    /// for synchronous, context-per-process claim/transfer calls.
    Direct,
    /// OS-native async transfer API (WinUSB/usbfs/IOKit), as used by the
    /// teacher throughout.
    Native,
    /// Android `UsbManager`/`UsbDeviceConnection` via JNI.
    #[cfg(target_os = "android")]
    UsbHost,
}

impl BackendKind {
    pub fn list_devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        match self {
            BackendKind::Direct => direct::list_devices(),
            BackendKind::Native => native::list_devices(),
            #[cfg(target_os = "android")]
            BackendKind::UsbHost => usbhost::list_devices(),
        }
    }

    pub fn open_device(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDevice>> {
        match self {
            BackendKind::Direct => direct::open_device(info),
            BackendKind::Native => native::open_device(info),
            #[cfg(target_os = "android")]
            BackendKind::UsbHost => usbhost::open_device(info),
        }
    }
}
