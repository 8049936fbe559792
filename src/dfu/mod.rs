//! DFU (Device Firmware Upgrade) state machine. Grounded on
//! `fw-update-device.cpp`: detach into DFU mode, read identity off the
//! upload-direction status payload, then a poll-driven download loop of
//! 1024-byte blocks terminated by a zero-length `DFU_DNLOAD`.

use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Result};
use bytemuck_derive::{Pod, Zeroable};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::usb::device::UsbMessenger;

const DFU_GETSTATUS_PACKET: u8 = 0xa1;
const DFU_DETACH_PACKET: u8 = 0x21;
const DFU_DOWNLOAD_PACKET: u8 = 0x21;
const TRANSFER_SIZE: usize = 1024;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DownloadSync = 3,
    DownloadBusy = 4,
    DownloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    #[default]
    Error = 10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DfuStatus {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbr = 0x0c,
    ErrPor = 0x0d,
    #[default]
    ErrUnknown = 0x0e,
    ErrStalledPkt = 0x0f,
}

#[derive(Copy, Clone, Debug)]
enum Command {
    Detach = 0,
    Download = 1,
    Upload = 2,
    GetStatus = 3,
    #[allow(dead_code)]
    ClearStatus = 4,
    GetState = 5,
    #[allow(dead_code)]
    Abort = 6,
}

/// Raw little-endian `DFU_GETSTATUS` response: `bStatus` is the low 8 bits
/// and `bwPollTimeout` the remaining 24 of the first word, exactly as
/// `dfu_status_payload`'s bitfield packs them.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct RawStatusPayload {
    status_and_poll_timeout: u32,
    b_state: u8,
    i_string: u8,
    _pad: u16,
}

#[derive(Copy, Clone, Debug)]
pub struct StatusPayload {
    pub status: DfuStatus,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

impl StatusPayload {
    fn from_raw(raw: RawStatusPayload) -> Self {
        StatusPayload {
            status: DfuStatus::from(raw.status_and_poll_timeout as u8),
            poll_timeout_ms: raw.status_and_poll_timeout >> 8,
            state: DfuState::from(raw.b_state),
        }
    }

    pub fn is_in_state(&self, state: DfuState) -> bool {
        self.status == DfuStatus::Ok && self.state == state
    }

    pub fn is_error_state(&self) -> bool {
        self.state == DfuState::Error
    }
}

/// 6 raw serial bytes plus 2 bytes of padding, as laid out in the
/// firmware's upload-direction status record.
#[derive(Copy, Clone, Default, Pod, Zeroable)]
#[repr(C)]
struct SerialNumberData {
    serial: [u8; 6],
    spare: [u8; 2],
}

/// The fields this driver reads out of the vendor's upload-direction
/// status payload; `spare`/version fields are retained only so the struct
/// matches the firmware's actual record size byte-for-byte.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct FwStatusPayload {
    _spare1: u32,
    fw_last_version: u32,
    fw_highest_version: u32,
    fw_download_status: u16,
    dfu_is_locked: u16,
    dfu_version: u16,
    serial_number: SerialNumberData,
    _spare2: [u8; 42],
}

pub fn get_state(messenger: &dyn UsbMessenger) -> Result<DfuState> {
    let mut buf = [0u8; 1];
    messenger
        .control_transfer(DFU_GETSTATUS_PACKET, Command::GetState as u8, 0, 0, &mut buf)
        .map_err(|e| anyhow::anyhow!("DFU_GETSTATE failed: {e:?}"))?;
    Ok(DfuState::from(buf[0]))
}

pub fn get_status(messenger: &dyn UsbMessenger) -> Result<StatusPayload> {
    let mut buf = [0u8; std::mem::size_of::<RawStatusPayload>()];
    messenger
        .control_transfer(DFU_GETSTATUS_PACKET, Command::GetStatus as u8, 0, 0, &mut buf)
        .map_err(|e| anyhow::anyhow!("DFU_GETSTATUS failed: {e:?}"))?;
    let raw: RawStatusPayload = bytemuck::pod_read_unaligned(&buf);
    Ok(StatusPayload::from_raw(raw))
}

fn detach(messenger: &dyn UsbMessenger) -> Result<()> {
    let timeout_ms: u16 = 1000;
    messenger
        .control_transfer(DFU_DETACH_PACKET, Command::Detach as u8, timeout_ms, 0, &mut [])
        .map_err(|e| anyhow::anyhow!("DFU_DETACH failed: {e:?}"))?;
    Ok(())
}

/// Poll `DFU_GETSTATUS` every 10ms (the firmware does not set a trustworthy
/// `bwPollTimeout`, so a fixed interval is used, matching the original)
/// until the device reports `state`, an error state, or `timeout` elapses.
pub fn wait_for_state(messenger: &dyn UsbMessenger, state: DfuState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match get_status(messenger) {
            Ok(status) => {
                if status.is_in_state(state) {
                    return true;
                }
                if status.is_error_state() {
                    return false;
                }
            }
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Result of entering DFU mode: the device's serial number, read out of
/// the firmware's own upload-direction status record as lowercase hex.
pub struct DfuIdentity {
    pub serial_number: String,
}

/// Detach the device into DFU mode and read back its identity. The caller
/// must have already re-opened the messenger against the device's
/// recovery-mode VID/PID if it re-enumerated after the detach.
pub fn enter_dfu_mode(messenger: &dyn UsbMessenger) -> Result<DfuIdentity> {
    let _ = get_state(messenger)?;
    detach(messenger)?;
    let state = get_state(messenger)?;
    ensure!(state == DfuState::DfuIdle, "failed to enter into dfu state (state={state:?})");

    let mut buf = [0u8; std::mem::size_of::<FwStatusPayload>()];
    messenger
        .control_transfer(DFU_GETSTATUS_PACKET, Command::Upload as u8, 0, 0, &mut buf)
        .map_err(|e| anyhow::anyhow!("DFU upload status read failed: {e:?}"))?;
    let payload: FwStatusPayload = bytemuck::pod_read_unaligned(&buf);

    let serial_number = payload
        .serial_number
        .serial
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    Ok(DfuIdentity { serial_number })
}

/// Send `fw_image` in `TRANSFER_SIZE`-byte blocks, polling to
/// `DownloadIdle` after each one, then terminate the transfer phase with a
/// zero-length `DFU_DNLOAD` and wait for the device to reach
/// `ManifestWaitReset` (which also resets the device back to its
/// application firmware).
pub fn download_firmware(
    messenger: &dyn UsbMessenger,
    fw_image: &[u8],
    mut on_progress: impl FnMut(f32),
) -> Result<()> {
    let total_blocks = fw_image.len().div_ceil(TRANSFER_SIZE).max(1);
    let mut block_number: u16 = 0;

    for chunk in fw_image.chunks(TRANSFER_SIZE) {
        let mut data = chunk.to_vec();
        messenger
            .control_transfer(DFU_DOWNLOAD_PACKET, Command::Download as u8, block_number, 0, &mut data)
            .map_err(|e| anyhow::anyhow!("DFU_DNLOAD block {block_number} failed: {e:?}"))?;
        if !wait_for_state(messenger, DfuState::DownloadIdle, DEFAULT_WAIT_TIMEOUT) {
            bail!("failed to download firmware at block {block_number}");
        }
        block_number += 1;
        on_progress(block_number as f32 / total_blocks as f32);
    }

    // Terminate the transfer phase.
    messenger
        .control_transfer(DFU_DOWNLOAD_PACKET, Command::Download as u8, block_number, 0, &mut [])
        .map_err(|e| anyhow::anyhow!("terminating DFU_DNLOAD failed: {e:?}"))?;

    if !wait_for_state(messenger, DfuState::ManifestWaitReset, DEFAULT_WAIT_TIMEOUT) {
        bail!("firmware manifest failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_payload_decodes_packed_bitfield() {
        // bStatus = 0x02 (ERR_FILE), bwPollTimeout = 0x001234
        let word: u32 = 0x0012_3402;
        let raw = RawStatusPayload {
            status_and_poll_timeout: word,
            b_state: DfuState::DfuIdle as u8,
            i_string: 0,
            _pad: 0,
        };
        let status = StatusPayload::from_raw(raw);
        assert_eq!(status.status, DfuStatus::ErrFile);
        assert_eq!(status.poll_timeout_ms, 0x001234);
        assert_eq!(status.state, DfuState::DfuIdle);
    }

    #[test]
    fn is_in_state_requires_ok_status() {
        let status = StatusPayload {
            status: DfuStatus::ErrWrite,
            poll_timeout_ms: 0,
            state: DfuState::DfuIdle,
        };
        assert!(!status.is_in_state(DfuState::DfuIdle));
    }

    #[test]
    fn serial_formats_as_lowercase_hex() {
        let serial = SerialNumberData { serial: [0x01, 0xab, 0x0f, 0x10, 0xff, 0x00], spare: [0, 0] };
        let hex: String = serial.serial.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "01ab0f10ff00");
    }

    #[test]
    fn unknown_status_byte_maps_to_unknown() {
        assert_eq!(DfuStatus::from(0xfe), DfuStatus::ErrUnknown);
    }
}
