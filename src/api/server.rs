// src/api/server.rs

//! The connection registry and per-tick server loop of the API.
//!
//! The server owns the listening socket and a flat `Vec` of live
//! connections. Each tick it drains pending accepts, steps every live
//! connection exactly once, and swap-removes finished connections in the
//! same pass. All mutation happens on the single event-loop thread.

use crate::api::codec;
use crate::api::connection::{Connection, Subscriptions};
use crate::api::entities::EntityRegistry;
use crate::api::message::{ApiMessage, EntityState, LogLevel};
use crate::api::services::ServiceRegistry;
use crate::config::Config;
use crate::core::EmberlinkError;
use crate::core::io;
use crate::device::{DeviceControl, NetworkMonitor, Preferences};
use bytes::Bytes;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Listen backlog. Intentionally small: the API serves a handful of
/// long-lived peers, not bursts of short requests.
const LISTEN_BACKLOG: i32 = 4;

/// Batch delay used once shutdown has begun, for quick flushing.
const SHUTDOWN_BATCH_DELAY: Duration = Duration::from_millis(5);

/// Preference key under which the pre-shared encryption key is persisted.
const NOISE_PSK_PREF_KEY: &str = "noise_psk";

/// A client's interest in one remote (Home Assistant) entity's state.
/// Appended at startup by collaborators; never removed for the process
/// lifetime. `once` subscriptions stop firing after the first match.
pub struct HaStateSubscription {
    pub entity_id: String,
    pub attribute: Option<String>,
    pub once: bool,
    fired: bool,
    callback: Box<dyn FnMut(String) + Send>,
}

/// State shared between the server and its connections during dispatch.
/// Split out of [`ApiServer`] so a connection can be stepped with `&mut`
/// access to this context while the registry `Vec` is borrowed separately.
pub struct ApiContext {
    pub name: String,
    pub password: Option<String>,
    pub batch_delay: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub shutting_down: bool,
    pub entities: EntityRegistry,
    pub services: ServiceRegistry,
    pub(crate) ha_subs: Vec<HaStateSubscription>,
    pub(crate) zwave_sink: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
}

impl ApiContext {
    pub fn new(config: &Config) -> Self {
        Self {
            name: config.name.clone(),
            password: config.password.clone(),
            batch_delay: config.batch_delay,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            shutting_down: false,
            entities: EntityRegistry::new(),
            services: ServiceRegistry::new(),
            ha_subs: Vec::new(),
            zwave_sink: None,
        }
    }

    /// Announcement messages for every registered HA state subscription,
    /// sent when a client subscribes to remote states.
    pub(crate) fn ha_subscription_announcements(
        &self,
    ) -> impl Iterator<Item = ApiMessage> + '_ {
        self.ha_subs.iter().map(|sub| {
            ApiMessage::SubscribeHomeAssistantStateResponse {
                entity_id: sub.entity_id.clone(),
                attribute: sub.attribute.clone().unwrap_or_default(),
                once: sub.once,
            }
        })
    }

    /// Routes a remote state notification to every matching subscription.
    pub(crate) fn dispatch_ha_state(&mut self, entity_id: &str, attribute: &str, state: String) {
        for sub in &mut self.ha_subs {
            if sub.entity_id != entity_id {
                continue;
            }
            let sub_attr = sub.attribute.as_deref().unwrap_or("");
            if sub_attr != attribute {
                continue;
            }
            if sub.once && sub.fired {
                continue;
            }
            sub.fired = true;
            (sub.callback)(state.clone());
        }
    }
}

/// The API server component.
pub struct ApiServer {
    listener: Option<TcpListener>,
    clients: Vec<Connection>,
    next_conn_id: u64,
    reboot_timeout: Duration,
    reboot_deadline: Option<Instant>,
    status_warning: bool,
    noise_psk: Option<Vec<u8>>,
    prefs: Arc<dyn Preferences>,
    device: Arc<dyn DeviceControl>,
    on_client_disconnected: Option<Box<dyn FnMut(&str) + Send>>,
    pub ctx: ApiContext,
}

impl ApiServer {
    /// Binds the listening socket and builds the server. A setup failure is
    /// fatal for the whole component; the caller is expected to disable it.
    pub fn setup(
        config: &Config,
        device: Arc<dyn DeviceControl>,
        prefs: Arc<dyn Preferences>,
    ) -> Result<Self, EmberlinkError> {
        let listener = io::listen_nonblocking(&config.host, config.api_port, LISTEN_BACKLOG)?;
        info!("API server listening on {}:{}", config.host, config.api_port);

        // A key saved by a previous run takes precedence over the config.
        let noise_psk = match prefs.load(NOISE_PSK_PREF_KEY) {
            Some(saved) => {
                debug!("Loaded saved encryption PSK");
                Some(saved)
            }
            None => config.noise_psk.clone(),
        };

        let mut server = Self {
            listener: Some(listener),
            clients: Vec::new(),
            next_conn_id: 0,
            reboot_timeout: config.reboot_timeout,
            reboot_deadline: None,
            status_warning: false,
            noise_psk,
            prefs,
            device,
            on_client_disconnected: None,
            ctx: ApiContext::new(config),
        };

        // Reboot if no client connects within the timeout window.
        if !server.reboot_timeout.is_zero() {
            server.schedule_reboot_timeout(Instant::now());
        }
        Ok(server)
    }

    pub fn is_connected(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers a callback fired with the client info string whenever a
    /// connection is removed from the registry.
    pub fn set_on_client_disconnected(&mut self, f: Box<dyn FnMut(&str) + Send>) {
        self.on_client_disconnected = Some(f);
    }

    /// Attaches the sink that receives Z-Wave frames forwarded by clients.
    pub fn set_zwave_sink(&mut self, sink: Box<dyn FnMut(Vec<u8>) + Send>) {
        self.ctx.zwave_sink = Some(sink);
    }

    fn schedule_reboot_timeout(&mut self, now: Instant) {
        self.status_warning = true;
        self.reboot_deadline = Some(now + self.reboot_timeout);
    }

    /// One pass of the server loop.
    pub fn tick(&mut self, network: &dyn NetworkMonitor, now: Instant) {
        // Accept all pending connections.
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("Accept {addr}: non-blocking failed: {e}");
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Accept {addr}: nodelay failed: {e}");
                        }
                        debug!("Accept {addr}");
                        self.next_conn_id += 1;
                        let mut conn = Connection::new(
                            stream,
                            self.next_conn_id,
                            addr.to_string(),
                            now,
                            &self.ctx,
                        );
                        conn.start();
                        self.clients.push(conn);

                        // Clear warning status and cancel reboot when the
                        // first client connects.
                        if self.clients.len() == 1 && !self.reboot_timeout.is_zero() {
                            self.status_warning = false;
                            self.reboot_deadline = None;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        break;
                    }
                }
            }
        }

        if self.clients.is_empty() {
            // Common idle case; only the reboot timer needs a look.
            if self.reboot_deadline.is_some_and(|deadline| now >= deadline) {
                self.reboot_deadline = None;
                self.device.reboot("no API clients within reboot timeout");
            }
            return;
        }

        // Check network connectivity once for all clients.
        if !network.is_connected() {
            for client in &mut self.clients {
                client.on_fatal_error("network down");
            }
            // Fall through so the removal pass below sweeps them up.
        }

        // Process clients and remove disconnected ones in a single pass.
        let ctx = &mut self.ctx;
        let on_disconnected = &mut self.on_client_disconnected;
        sweep_registry(
            &mut self.clients,
            |client| client.marked_for_removal(),
            |client| client.tick(ctx, now),
            |client| {
                debug!("Remove connection {}", client.client_info);
                if let Some(f) = on_disconnected.as_mut() {
                    f(&client.client_info);
                }
            },
        );

        // Schedule reboot when the last client disconnects.
        if self.clients.is_empty() && !self.reboot_timeout.is_zero() {
            self.schedule_reboot_timeout(now);
        }
    }

    // --- Fan-out entry points (called by external collaborators) ---

    /// Records a new state for an entity and broadcasts it to subscribed
    /// clients. Internal entities are filtered out once, before the loop.
    pub fn on_entity_update(&mut self, key: u32, state: EntityState) {
        let Some(entity) = self.ctx.entities.update_state(key, state) else {
            debug!("State update for unknown entity key {key}");
            return;
        };
        if entity.internal {
            return;
        }
        let msg = ApiMessage::EntityStateResponse {
            key: entity.key,
            state: entity.state.clone(),
        };
        self.broadcast(&msg, Subscriptions::STATES, None);
    }

    /// Forwards a log line to clients subscribed to logs at this level.
    pub fn try_send_log_message(&mut self, level: LogLevel, tag: &str, line: &str) {
        if self.ctx.shutting_down {
            // Sending logs during shutdown could recurse into the buffers
            // we are trying to drain.
            return;
        }
        let msg = ApiMessage::LogMessageResponse {
            level,
            tag: tag.to_string(),
            line: line.to_string(),
        };
        self.broadcast(&msg, Subscriptions::LOGS, Some(level));
    }

    /// Broadcasts a camera frame to streaming subscribers.
    pub fn send_camera_image(&mut self, data: Vec<u8>, done: bool) {
        let msg = ApiMessage::CameraImageResponse { data, done };
        self.broadcast(&msg, Subscriptions::CAMERA, None);
    }

    /// Broadcasts a Home Assistant service call to subscribed clients.
    pub fn send_homeassistant_service_call(
        &mut self,
        service: String,
        data: Vec<(String, String)>,
        is_event: bool,
    ) {
        let msg = ApiMessage::HomeassistantServiceResponse {
            service,
            data,
            is_event,
        };
        self.broadcast(&msg, Subscriptions::HA_SERVICES, None);
    }

    /// Forwards a Z-Wave frame to every authenticated client.
    pub fn send_zwave_frame(&mut self, data: Vec<u8>) {
        let msg = ApiMessage::ZWaveProxyFrame { data };
        self.broadcast(&msg, Subscriptions::empty(), None);
    }

    /// Encodes `msg` once and enqueues the shared bytes on every live,
    /// authenticated connection holding all of `wanted` subscriptions.
    fn broadcast(&mut self, msg: &ApiMessage, wanted: Subscriptions, min_level: Option<LogLevel>) {
        let bytes: Bytes = match codec::encode_frame(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping broadcast of {}: {e}", msg.name());
                return;
            }
        };
        let now = Instant::now();
        for client in &mut self.clients {
            if client.marked_for_removal() || !client.is_authenticated() {
                continue;
            }
            if !client.subscriptions.contains(wanted) {
                continue;
            }
            if let Some(level) = min_level {
                if client.log_level() < level {
                    continue;
                }
            }
            client.enqueue_shared(bytes.clone(), now, &self.ctx);
        }
    }

    // --- Home Assistant state subscriptions ---

    /// Registers a persistent interest in a remote entity's state.
    pub fn subscribe_home_assistant_state(
        &mut self,
        entity_id: String,
        attribute: Option<String>,
        callback: Box<dyn FnMut(String) + Send>,
    ) {
        self.ctx.ha_subs.push(HaStateSubscription {
            entity_id,
            attribute,
            once: false,
            fired: false,
            callback,
        });
    }

    /// Requests a remote entity's state once.
    pub fn get_home_assistant_state(
        &mut self,
        entity_id: String,
        attribute: Option<String>,
        callback: Box<dyn FnMut(String) + Send>,
    ) {
        self.ctx.ha_subs.push(HaStateSubscription {
            entity_id,
            attribute,
            once: true,
            fired: false,
            callback,
        });
    }

    // --- Encryption key management ---

    /// Persists a new pre-shared encryption key and, when `make_active`,
    /// disconnects all clients so they reconnect under the new key.
    pub fn save_encryption_key(&mut self, psk: Vec<u8>, make_active: bool) -> bool {
        if self.noise_psk.as_deref() == Some(psk.as_slice()) {
            warn!("New PSK matches old");
            return true;
        }
        if !self.prefs.save(NOISE_PSK_PREF_KEY, &psk) {
            warn!("Failed to save encryption PSK");
            return false;
        }
        debug!("Encryption PSK saved");
        if make_active {
            warn!("Disconnecting all clients to reset connections");
            self.noise_psk = Some(psk);
            let now = Instant::now();
            for client in &mut self.clients {
                client.schedule_message_front(&ApiMessage::DisconnectRequest, now);
            }
        } else {
            self.noise_psk = Some(psk);
        }
        true
    }

    // --- Shutdown ---

    /// Begins a graceful shutdown: stop accepting, switch to quick flushing,
    /// and ask every client to disconnect with priority delivery.
    pub fn on_shutdown(&mut self) {
        self.ctx.shutting_down = true;

        // Close the listening socket to prevent new connections.
        self.listener = None;

        // Quick flushing while draining.
        self.ctx.batch_delay = SHUTDOWN_BATCH_DELAY;

        let now = Instant::now();
        for client in &mut self.clients {
            if !client.marked_for_removal() {
                client.schedule_message_front(&ApiMessage::DisconnectRequest, now);
            }
        }
    }

    /// One teardown step. Returns true when all clients are gone (or the
    /// network is down, in which case flushing buffers is pointless).
    pub fn teardown(&mut self, network: &dyn NetworkMonitor, now: Instant) -> bool {
        if !network.is_connected() {
            return true;
        }
        self.tick(network, now);
        self.clients.is_empty()
    }
}

/// Sweeps a registry in a single pass: live entries are processed exactly
/// once, removed entries are reported and swap-removed.
///
/// Removal swaps the current slot with the last element and pops; the scan
/// index does NOT advance after a removal so the swapped-in element is also
/// visited this pass. Order across the registry is not preserved, which is
/// acceptable for unordered peers.
pub fn sweep_registry<T>(
    items: &mut Vec<T>,
    is_removed: impl Fn(&T) -> bool,
    mut process: impl FnMut(&mut T),
    mut on_remove: impl FnMut(&T),
) {
    let mut index = 0;
    while index < items.len() {
        if !is_removed(&items[index]) {
            // Common case: process the live entry.
            process(&mut items[index]);
            index += 1;
            continue;
        }

        // Rare case: handle removal.
        on_remove(&items[index]);
        let last = items.len() - 1;
        if index < last {
            items.swap(index, last);
        }
        items.pop();
        // Do not advance: the swapped-in element must be visited this pass.
    }
}
