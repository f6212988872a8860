// src/server/context.rs

use crate::api::ApiServer;
use crate::config::Config;
use crate::device::{DeviceControl, NetworkMonitor};
use crate::ota::OtaServer;
use std::sync::Arc;

/// Holds all the initialized state required to run the event loop.
pub struct ServerContext {
    pub config: Config,
    pub api: ApiServer,
    pub ota: OtaServer,
    pub device: Arc<dyn DeviceControl>,
    pub network: Arc<dyn NetworkMonitor>,
}
