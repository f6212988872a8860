// src/server/initialization.rs

//! Handles the one-time setup phase: host capabilities, preference storage,
//! and binding both listening sockets. Any failure here is fatal; the daemon
//! refuses to start half-configured.

use super::context::ServerContext;
use crate::api::ApiServer;
use crate::config::Config;
use crate::device::{
    AlwaysUp, DeviceControl, FilePreferences, HostDevice, NetworkMonitor, Preferences,
};
use crate::ota::{FileBackend, OtaServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub fn setup(config: Config) -> Result<ServerContext> {
    info!(
        "Starting emberlink v{} as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.name
    );

    let device: Arc<dyn DeviceControl> = Arc::new(HostDevice::new());
    let network: Arc<dyn NetworkMonitor> = Arc::new(AlwaysUp);
    let prefs: Arc<dyn Preferences> = Arc::new(FilePreferences::new(&config.data_dir));

    let api = ApiServer::setup(&config, device.clone(), prefs)
        .context("Failed to set up the API server")?;

    let backend = Box::new(FileBackend::new(&config.ota.staging_dir));
    let ota = OtaServer::setup(&config, device.clone(), backend)
        .context("Failed to set up the OTA server")?;

    Ok(ServerContext {
        config,
        api,
        ota,
        device,
        network,
    })
}
