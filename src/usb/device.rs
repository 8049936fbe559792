//! Capability-interface traits an open device exposes, independent of
//! which backend (direct/native/usbhost, §4.C) provides them. Grounded on
//! the teacher's `BackendDevice`/`BackendHandle` split in `backend/mod.rs`:
//! one trait for an un-opened, cloneable handle, another for the opened
//! device that does I/O.

use anyhow::{Error, Result};
use async_trait::async_trait;

use super::request::{UsbRequest, UsbRequestCallback};
use super::{Interface, UsbDescriptor, UsbDeviceInfo, UsbStatus};

/// Upper bound on a hardware-monitor response, matching the fixed-size
/// buffer the original driver's `hw_monitor_response` reads into.
pub const HWM_RESPONSE_BUFFER_LEN: usize = 1024;

/// A USB device identified by enumeration but not yet opened.
pub trait UsbDevice: Send + Sync {
    fn info(&self) -> &UsbDeviceInfo;

    /// Open the device, claiming no interfaces yet.
    fn open(&self) -> Result<Box<dyn UsbMessenger>, Error>;

    fn duplicate(&self) -> Box<dyn UsbDevice>;
}

/// An opened device: claim/release interfaces, issue control transfers,
/// and submit asynchronous bulk transfers. Named after the "messenger"
/// role in spec.md §4.B — the thing callers actually talk to once a
/// device is open.
#[async_trait]
pub trait UsbMessenger: Send + Sync {
    fn descriptor(&self) -> &UsbDescriptor;

    fn claim_interface(&self, interface_number: u8) -> Result<(), UsbStatus>;

    fn release_interface(&self, interface_number: u8) -> Result<(), UsbStatus>;

    fn set_alt_setting(&self, interface_number: u8, alt_setting: u8) -> Result<(), UsbStatus>;

    /// Blocking control transfer (used for UVC probe/commit, DFU control
    /// requests, and the HWM vendor channel).
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize, UsbStatus>;

    /// Submit an asynchronous bulk IN transfer on `endpoint`; `callback`
    /// fires once on completion (or cancellation).
    async fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        callback: UsbRequestCallback,
    ) -> Result<(), UsbStatus>;

    /// Submit an asynchronous bulk OUT transfer.
    async fn submit_bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        callback: UsbRequestCallback,
    ) -> Result<(), UsbStatus>;

    /// Blocking bulk transfer: reads into `data` for an IN endpoint
    /// (bit 7 set), writes `data` for an OUT endpoint. Used by the HWM
    /// request/response channel, which has no need for the async
    /// callback machinery the UVC streaming path uses.
    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout_ms: u32) -> Result<usize, UsbStatus>;

    /// `CLEAR_FEATURE(ENDPOINT_HALT)` on `endpoint` — clears a stalled
    /// pipe without renegotiating the alternate setting. Distinct from
    /// `set_alt_setting(iface, 0)`, which is `SET_INTERFACE` and does not
    /// clear a halt condition.
    fn reset_endpoint(&self, endpoint: u8, timeout_ms: u32) -> Result<(), UsbStatus>;

    fn interface_for(&self, interface_number: u8) -> Option<&Interface> {
        self.descriptor()
            .interfaces
            .iter()
            .find(|i| i.interface_number == interface_number)
    }

    /// Build a request buffer of `length` bytes for `endpoint`. Callers
    /// pass the result to `submit_request`/`cancel_request`.
    fn create_request(&self, endpoint: u8, length: usize) -> UsbRequest {
        UsbRequest {
            endpoint,
            buffer: vec![0u8; length],
            actual_length: 0,
            status: UsbStatus::Success,
        }
    }

    /// Submit a previously-created request object, dispatching to
    /// `submit_bulk_in`/`submit_bulk_out` by the endpoint's direction bit.
    async fn submit_request(&self, request: UsbRequest, callback: UsbRequestCallback) -> Result<(), UsbStatus> {
        if request.endpoint & 0x80 != 0 {
            self.submit_bulk_in(request.endpoint, request.buffer.len(), callback).await
        } else {
            self.submit_bulk_out(request.endpoint, request.buffer, callback).await
        }
    }

    /// Cancel an in-flight request. `callback` is the same
    /// `UsbRequestCallback` passed to `submit_request`; cancelling it
    /// suppresses the completion if it hasn't already fired.
    fn cancel_request(&self, callback: &UsbRequestCallback) {
        callback.cancel();
    }

    /// Paired bulk write then bulk read over the vendor hardware-monitor
    /// channel: write `command` to `out_endpoint`, then read up to
    /// `HWM_RESPONSE_BUFFER_LEN` bytes back from `in_endpoint`. Used to
    /// fetch the GVD block that `gvd::decode_into_registry` parses.
    fn send_receive_transfer(
        &self,
        out_endpoint: u8,
        in_endpoint: u8,
        command: &[u8],
        timeout_ms: u32,
    ) -> Result<Vec<u8>, UsbStatus> {
        let mut out = command.to_vec();
        self.bulk_transfer(out_endpoint, &mut out, timeout_ms)?;
        let mut response = vec![0u8; HWM_RESPONSE_BUFFER_LEN];
        let n = self.bulk_transfer(in_endpoint, &mut response, timeout_ms)?;
        response.truncate(n);
        Ok(response)
    }
}

/// Convenience used by the DFU engine and the HWM channel, which issue one
/// control transfer at a time and want a `UsbRequest`-shaped result rather
/// than a raw byte count.
pub fn synchronous_control(
    messenger: &dyn UsbMessenger,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    buffer: &mut [u8],
) -> UsbRequest {
    match messenger.control_transfer(request_type, request, value, index, buffer) {
        Ok(actual_length) => UsbRequest {
            endpoint: 0,
            buffer: buffer.to_vec(),
            actual_length,
            status: UsbStatus::Success,
        },
        Err(status) => UsbRequest {
            endpoint: 0,
            buffer: buffer.to_vec(),
            actual_length: 0,
            status,
        },
    }
}
