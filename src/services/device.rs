//! Serial device discovery

use log::warn;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Name prefixes of USB serial adapters and CDC-ACM devices
pub const SERIAL_DEVICE_PREFIXES: [&str; 2] = ["ttyUSB", "ttyACM"];

/// Sorted list of serial device paths in `device_dir`
pub fn list_serial_devices(device_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(device_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to scan {device_dir:?} for serial devices: {e}");
            return Vec::new();
        }
    };

    let mut devices: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            SERIAL_DEVICE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .map(|entry| entry.path())
        .collect();

    devices.sort();
    devices
}
