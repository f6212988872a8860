// src/device/mod.rs

//! Host-capability seams.
//!
//! The protocol core never talks to the platform directly. Reboots, watchdog
//! feeding, network link status, and persistent preferences are all reached
//! through these traits so the event loop can own concrete implementations
//! and tests can substitute doubles.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Control over the device's own lifecycle.
pub trait DeviceControl: Send + Sync {
    /// Requests an immediate reboot. The event loop observes the request via
    /// [`DeviceControl::reboot_requested`] and winds the process down.
    fn reboot(&self, reason: &str);

    /// Requests a reboot after pending work (e.g. a flushed OTA image) has
    /// settled. On a host daemon this is the same as [`DeviceControl::reboot`]
    /// with a short grace note in the log.
    fn safe_reboot(&self, reason: &str);

    /// Feeds the watchdog. Called from busy-poll loops that monopolize the
    /// single execution thread.
    fn feed_watchdog(&self);

    fn reboot_requested(&self) -> bool;
}

/// Reports whether the underlying network link is usable.
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Persistent key-value preference storage.
pub trait Preferences: Send + Sync {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn save(&self, key: &str, value: &[u8]) -> bool;
}

/// Default [`DeviceControl`] for running as a host daemon: a reboot request
/// is recorded and the supervisor (systemd, runit, ...) is expected to
/// restart the process once it exits.
#[derive(Debug, Default)]
pub struct HostDevice {
    reboot_requested: AtomicBool,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceControl for HostDevice {
    fn reboot(&self, reason: &str) {
        error!("Reboot requested: {reason}");
        self.reboot_requested.store(true, Ordering::SeqCst);
    }

    fn safe_reboot(&self, reason: &str) {
        info!("Safe reboot requested: {reason}");
        self.reboot_requested.store(true, Ordering::SeqCst);
    }

    fn feed_watchdog(&self) {
        // The host has no hardware watchdog; the call is kept for trace-level
        // visibility of busy-poll phases.
        debug!(target: "emberlink::watchdog", "fed");
    }

    fn reboot_requested(&self) -> bool {
        self.reboot_requested.load(Ordering::SeqCst)
    }
}

/// A [`NetworkMonitor`] that always reports the link as up. Suitable for
/// hosts with wired connectivity where link loss also severs the sockets.
#[derive(Debug, Default)]
pub struct AlwaysUp;

impl NetworkMonitor for AlwaysUp {
    fn is_connected(&self) -> bool {
        true
    }
}

/// File-backed [`Preferences`] storing one file per key under a data dir.
#[derive(Debug)]
pub struct FilePreferences {
    dir: PathBuf,
}

impl FilePreferences {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.pref"))
    }
}

impl Preferences for FilePreferences {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    fn save(&self, key: &str, value: &[u8]) -> bool {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create preference dir: {e}");
            return false;
        }
        match fs::write(self.path_for(key), value) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save preference '{key}': {e}");
                false
            }
        }
    }
}
