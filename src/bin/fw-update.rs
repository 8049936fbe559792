//! Firmware update CLI. Grounded on `rs-fw-update.cpp`: list attached
//! devices, push a device into DFU mode by serial number, or scan for
//! devices already in recovery mode and update every one found, reporting
//! block-by-block progress on stdout. Argument parsing follows the
//! teacher's `cli_capture::SubCommandCliCapture` (`argh::FromArgs`, short
//! and long flags, string defaults), and `ctrlc` is wired the same way
//! `cli_capture::headless_capture` wires its capture-stop watchdog.

use std::fs;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;

use depthcam_driver::dfu;
use depthcam_driver::gvd::{self, CameraInfo};
use depthcam_driver::usb::backend::BackendKind;
use depthcam_driver::usb::enumerator::Enumerator;
use depthcam_driver::usb::{InterfaceSubclass, UsbDeviceInfo};

/// Target device identifiers for this tool. A real deployment would carry
/// a table of (normal, recovery) PID pairs per SKU, the way
/// `fw-update-factory.cpp`'s `rs400_sku_recovery_pid` does; this tool
/// targets a single device family and takes the recovery PID as the
/// thing that changes once `enter_dfu_mode` resets the device.
const VENDOR_ID: u16 = 0x8086;
const PRODUCT_ID: u16 = 0x0b07;
const RECOVERY_PRODUCT_ID: u16 = 0x0adb;

const DEVICE_REAPPEAR_TIMEOUT: Duration = Duration::from_secs(5);

/// Update a camera's firmware over DFU.
#[derive(FromArgs, PartialEq, Debug)]
struct Args {
    /// list attached devices and exit
    #[argh(switch, short = 'l', long = "list_devices")]
    list_devices: bool,

    /// scan for devices already in recovery mode and update them
    #[argh(switch, short = 'r', long = "recover")]
    recover: bool,

    /// path to a firmware image file
    #[argh(option, short = 'f', long = "file", default = "String::new()")]
    file: String,

    /// serial number of the device to update
    #[argh(option, short = 's', long = "serial_number", default = "String::new()")]
    serial_number: String,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let enumerator = Enumerator::new(BackendKind::Native);

    if args.list_devices {
        return list_devices(&enumerator);
    }

    if args.serial_number.is_empty() && !args.recover {
        bail!("either --recover or --serial_number must be given");
    }

    if args.file.is_empty() {
        bail!("--file is required");
    }

    println!("update to FW: {}\n", args.file);
    let fw_image = fs::read(&args.file).with_context(|| format!("reading firmware file {}", args.file))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupted.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let mut updated = false;

    if !args.serial_number.is_empty() {
        updated = update_by_serial(&enumerator, &args.serial_number, &fw_image, &interrupted)?;
        if !updated {
            println!("couldn't find the requested serial number");
        }
    }

    if args.recover {
        println!("check for devices in recovery mode...");
        if try_update_recovery_devices(&enumerator, &fw_image, &interrupted)? {
            println!("device recovered");
            updated = true;
        } else {
            println!("no devices in recovery mode found");
        }
    }

    if updated {
        Ok(())
    } else {
        bail!("firmware update did not complete")
    }
}

fn list_devices(enumerator: &Enumerator) -> Result<()> {
    let devices = enumerator.query_devices_info(VENDOR_ID, None)?;
    if devices.is_empty() {
        println!("no devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:04x}:{:04x} serial={} bus={} address={} mi={}",
            device.vendor_id,
            device.product_id,
            device.serial_number.as_deref().unwrap_or("<unknown>"),
            device.bus_number,
            device.device_address,
            device.mi,
        );
        if let Some(line) = camera_info_line(enumerator, &device) {
            println!("  {line}");
        }
    }
    Ok(())
}

/// Best-effort GVD read over the device's hardware-monitor interface, if
/// it has one. Devices without an HWM channel (or mid-DFU devices) simply
/// don't print a second line; this is informational, not required for
/// `--list_devices` to succeed.
fn camera_info_line(enumerator: &Enumerator, info: &UsbDeviceInfo) -> Option<String> {
    let device = enumerator.create_usb_device(info).ok()?;
    let messenger = device.open().ok()?;
    let hwm_interface = messenger.descriptor().interfaces_of(InterfaceSubclass::Hwm).next()?.clone();
    let pid_hex = format!("0x{:04x}", info.product_id);
    let registry = gvd::read_via_hwm(messenger.as_ref(), &hwm_interface, "camera", &pid_hex).ok()?;
    Some(format!(
        "name={} serial={} fw={}",
        registry.get_info(CameraInfo::Name).unwrap_or("?"),
        registry.get_info(CameraInfo::SerialNumber).unwrap_or("?"),
        registry.get_info(CameraInfo::FirmwareVersion).unwrap_or("?"),
    ))
}

/// Detach the named device into DFU mode, wait for it to re-enumerate
/// under the recovery PID, then run the download. Mirrors
/// `rs-fw-update.cpp`'s per-device loop in `main`.
fn update_by_serial(
    enumerator: &Enumerator,
    serial_number: &str,
    fw_image: &[u8],
    interrupted: &AtomicBool,
) -> Result<bool> {
    println!("search for device with serial number: {serial_number}");

    let devices = enumerator.query_devices_info(VENDOR_ID, Some(PRODUCT_ID))?;
    let Some(info) = devices.into_iter().find(|d| d.serial_number.as_deref() == Some(serial_number)) else {
        return Ok(false);
    };

    let device = enumerator.create_usb_device(&info)?;
    let messenger = device.open()?;
    println!("device found, entering DFU mode");
    dfu::enter_dfu_mode(messenger.as_ref())?;

    let recovered = enumerator.wait_for_serial(VENDOR_ID, RECOVERY_PRODUCT_ID, serial_number, DEVICE_REAPPEAR_TIMEOUT);
    let recovered_info = match recovered {
        Ok(info) => info,
        Err(_) => return Ok(false),
    };

    run_download(enumerator, &recovered_info, fw_image, interrupted)
}

/// Scan for any device already sitting in recovery mode and update it,
/// mirroring `try_update`'s fallback path in `rs-fw-update.cpp`.
fn try_update_recovery_devices(enumerator: &Enumerator, fw_image: &[u8], interrupted: &AtomicBool) -> Result<bool> {
    let devices = enumerator.query_devices_info(VENDOR_ID, Some(RECOVERY_PRODUCT_ID))?;
    for info in devices {
        if run_download(enumerator, &info, fw_image, interrupted)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn run_download(enumerator: &Enumerator, info: &UsbDeviceInfo, fw_image: &[u8], interrupted: &AtomicBool) -> Result<bool> {
    let device = enumerator.create_usb_device(info)?;
    let messenger = device.open()?;

    println!("\nFW update started\n");
    dfu::download_firmware(messenger.as_ref(), fw_image, |progress| {
        print!("\rFW update progress: {}[%]", (progress * 100.0) as i32);
        let _ = std::io::stdout().flush();
        if interrupted.load(Ordering::SeqCst) {
            eprintln!("\nCtrl+C received, firmware update cannot be safely cancelled mid-transfer");
        }
    })?;
    println!("\n\nFW update done");
    Ok(true)
}
