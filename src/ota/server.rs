// src/ota/server.rs

//! The OTA listener. Holds at most one session at a time; further clients
//! wait in the (small) accept backlog until the current session settles.

use crate::config::Config;
use crate::core::EmberlinkError;
use crate::core::io;
use crate::device::DeviceControl;
use crate::ota::backend::OtaBackend;
use crate::ota::events::{OtaEvent, OtaObserver};
use crate::ota::session::{MagicPoll, OtaSession};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const LISTEN_BACKLOG: i32 = 4;

pub struct OtaServer {
    listener: Option<TcpListener>,
    session: Option<OtaSession>,
    config: crate::config::OtaConfig,
    backend: Box<dyn OtaBackend>,
    device: Arc<dyn DeviceControl>,
    observers: Vec<Box<dyn OtaObserver>>,
}

impl OtaServer {
    /// Binds the OTA port and builds the server.
    pub fn setup(
        config: &Config,
        device: Arc<dyn DeviceControl>,
        backend: Box<dyn OtaBackend>,
    ) -> Result<Self, EmberlinkError> {
        let listener = io::listen_nonblocking(&config.host, config.ota.port, LISTEN_BACKLOG)?;
        info!(
            "OTA server listening on {}:{} (version {})",
            config.host, config.ota.port, config.ota.version
        );
        Ok(Self {
            listener: Some(listener),
            session: None,
            config: config.ota.clone(),
            backend,
            device,
            observers: Vec::new(),
        })
    }

    pub fn add_observer(&mut self, observer: Box<dyn OtaObserver>) {
        self.observers.push(observer);
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    /// One pass of the OTA loop. Cheap while idle; once a client passes the
    /// magic handshake this call runs the whole transfer before returning.
    pub async fn tick(&mut self, now: Instant) {
        if self.session.is_none() {
            if let Some(listener) = &self.listener {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("OTA accept {addr}: non-blocking failed: {e}");
                            return;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("OTA accept {addr}: nodelay failed: {e}");
                        }
                        info!("OTA connection from {addr}");
                        self.session = Some(OtaSession::new(stream, addr.to_string(), now));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => warn!("OTA accept failed: {e}"),
                }
            }
        }

        match self.session.as_mut().map(|s| s.poll_magic(now)) {
            None | Some(MagicPoll::Pending) => return,
            Some(MagicPoll::Failed) => {
                self.session = None;
                return;
            }
            Some(MagicPoll::Ready) => {}
        }

        if let Some(session) = self.session.take() {
            let observers = &mut self.observers;
            let mut notify = |event: OtaEvent| {
                for observer in observers.iter_mut() {
                    observer.on_event(&event);
                }
            };
            session
                .transfer(&self.config, &*self.device, &mut *self.backend, &mut notify)
                .await;
        }
    }

    /// Stops accepting and drops any session still in the magic handshake.
    pub fn on_shutdown(&mut self) {
        self.listener = None;
        self.session = None;
    }
}
