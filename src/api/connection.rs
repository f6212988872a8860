// src/api/connection.rs

//! The per-connection protocol state machine.
//!
//! A `Connection` owns one accepted nonblocking socket and survives across
//! event-loop ticks: partial inbound frames, the outbound batch queue, and
//! keepalive deadlines all live here rather than on a call stack. All
//! failures set the `remove` flag; the registry sweep in
//! [`crate::api::server`] performs the actual teardown.

use crate::api::codec;
use crate::api::frame::FrameCodec;
use crate::api::message::{ApiMessage, LogLevel};
use crate::api::server::ApiContext;
use crate::core::io::{self, IoOutcome};
use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::TcpStream;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Outbound batch buffer budget. Exceeding it forces an immediate flush.
const TX_BATCH_CAPACITY: usize = 8 * 1024;

/// Bytes read from the socket per syscall while draining inbound data.
const RX_CHUNK_SIZE: usize = 2048;

bitflags! {
    /// Fan-out categories this connection has subscribed to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Subscriptions: u8 {
        const STATES      = 1 << 0;
        const LOGS        = 1 << 1;
        const HA_SERVICES = 1 << 2;
        const HA_STATES   = 1 << 3;
        const CAMERA      = 1 << 4;
    }
}

/// Protocol phase of a connection. The `remove` flag is orthogonal and may
/// be set from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHandshake,
    AwaitingAuth,
    Authenticated,
}

pub struct Connection {
    stream: TcpStream,
    pub(crate) id: u64,
    pub(crate) peer: String,
    /// Combined client name + peer string for logging, filled by Hello.
    pub(crate) client_info: String,
    phase: Phase,
    pub(crate) remove: bool,
    pub(crate) subscriptions: Subscriptions,
    log_level: LogLevel,
    codec: FrameCodec,
    inbound: BytesMut,
    outbound: VecDeque<Bytes>,
    outbound_bytes: usize,
    /// Offset into the front outbound element already written to the socket.
    write_offset: usize,
    flush_at: Option<Instant>,
    next_ping: Instant,
    pong_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(stream: TcpStream, id: u64, peer: String, now: Instant, ctx: &ApiContext) -> Self {
        Self {
            stream,
            id,
            client_info: peer.clone(),
            peer,
            phase: Phase::AwaitingHandshake,
            remove: false,
            subscriptions: Subscriptions::empty(),
            log_level: LogLevel::Info,
            codec: FrameCodec,
            inbound: BytesMut::with_capacity(RX_CHUNK_SIZE),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            write_offset: 0,
            flush_at: None,
            next_ping: now + ctx.keepalive_interval,
            pong_deadline: None,
        }
    }

    /// Called once right after the connection is appended to the registry.
    pub fn start(&mut self) {
        debug!("Connection #{} from {}: awaiting handshake", self.id, self.peer);
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    pub fn marked_for_removal(&self) -> bool {
        self.remove
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Marks the connection for removal. Idempotent; once set, no further
    /// work is dispatched to this connection.
    pub fn on_fatal_error(&mut self, why: &str) {
        if !self.remove {
            warn!("{}: {why}; disconnect", self.client_info);
            self.remove = true;
        }
    }

    /// One event-loop tick: drain inbound bytes into frames, run keepalive,
    /// flush the outbound batch if its deadline passed.
    pub fn tick(&mut self, ctx: &mut ApiContext, now: Instant) {
        self.read_inbound(ctx, now);
        if self.remove {
            return;
        }
        self.keepalive(ctx, now);
        if self.remove {
            return;
        }
        if self.flush_at.is_some_and(|at| now >= at) {
            self.flush(now);
        }
    }

    fn read_inbound(&mut self, ctx: &mut ApiContext, now: Instant) {
        let mut scratch = [0u8; RX_CHUNK_SIZE];
        loop {
            match io::try_read(&mut self.stream, &mut scratch) {
                Ok(IoOutcome::Transferred(n)) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                }
                Ok(IoOutcome::WouldBlock) => break,
                Ok(IoOutcome::Closed) => {
                    debug!("{}: closed by peer", self.client_info);
                    self.remove = true;
                    break;
                }
                Err(e) => {
                    if io::is_normal_disconnect(&e) {
                        debug!("{}: closed by peer: {e}", self.client_info);
                        self.remove = true;
                    } else {
                        self.on_fatal_error(&format!("read error: {e}"));
                    }
                    break;
                }
            }
        }

        // Drain all complete frames accumulated so far; partial frames stay
        // in the buffer for the next tick.
        while !self.remove {
            match self.codec.decode(&mut self.inbound) {
                Ok(Some(frame)) => self.handle_frame(frame, ctx, now),
                Ok(None) => break,
                Err(e) => {
                    self.on_fatal_error(&format!("frame error: {e}"));
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: crate::api::frame::Frame, ctx: &mut ApiContext, now: Instant) {
        let msg = match codec::decode_payload(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.on_fatal_error(&format!("decode error for type {}: {e}", frame.msg_type));
                return;
            }
        };

        // Unauthenticated connections may only speak the handshake subset.
        if !self.is_authenticated() && !handshake_message(&msg) {
            self.on_fatal_error(&format!("{} before authentication", msg.name()));
            return;
        }

        match msg {
            ApiMessage::Hello {
                client_info,
                api_version_major,
                api_version_minor,
            } => self.on_hello(ctx, client_info, api_version_major, api_version_minor, now),
            ApiMessage::ConnectRequest { password } => self.on_connect(ctx, password, now),
            ApiMessage::PingRequest => self.send_message(&ApiMessage::PingResponse, ctx, now),
            ApiMessage::PingResponse => {
                self.pong_deadline = None;
            }
            ApiMessage::DisconnectRequest => {
                self.schedule_message_front(&ApiMessage::DisconnectResponse, now);
                self.remove = true;
            }
            ApiMessage::DisconnectResponse => {
                self.remove = true;
            }
            ApiMessage::DeviceInfoRequest => {
                let response = ApiMessage::DeviceInfoResponse {
                    name: ctx.name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uses_password: ctx.password.is_some(),
                };
                self.send_message(&response, ctx, now);
            }
            ApiMessage::ListEntitiesRequest => self.on_list_entities(ctx, now),
            ApiMessage::SubscribeStatesRequest => {
                self.subscriptions |= Subscriptions::STATES;
                self.send_all_states(ctx, now);
            }
            ApiMessage::SubscribeLogsRequest { level } => {
                self.subscriptions |= Subscriptions::LOGS;
                self.log_level = level;
            }
            ApiMessage::SubscribeHomeassistantServicesRequest => {
                self.subscriptions |= Subscriptions::HA_SERVICES;
            }
            ApiMessage::SubscribeHomeAssistantStatesRequest => {
                self.subscriptions |= Subscriptions::HA_STATES;
                let subs: Vec<ApiMessage> = ctx
                    .ha_subscription_announcements()
                    .collect();
                for msg in subs {
                    self.send_message(&msg, ctx, now);
                }
            }
            ApiMessage::HomeAssistantStateResponse {
                entity_id,
                attribute,
                state,
            } => ctx.dispatch_ha_state(&entity_id, &attribute, state),
            ApiMessage::GetTimeRequest => {
                let epoch_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                self.send_message(&ApiMessage::GetTimeResponse { epoch_seconds }, ctx, now);
            }
            ApiMessage::ExecuteServiceRequest { key, args } => {
                let response = match ctx.services.execute(key, &args) {
                    Ok(()) => ApiMessage::ExecuteServiceResponse {
                        success: true,
                        error: String::new(),
                    },
                    Err(e) => {
                        debug!("{}: service call rejected: {e}", self.client_info);
                        ApiMessage::ExecuteServiceResponse {
                            success: false,
                            error: e.to_string(),
                        }
                    }
                };
                self.send_message(&response, ctx, now);
            }
            ApiMessage::CameraImageRequest { single, stream } => {
                if stream {
                    self.subscriptions |= Subscriptions::CAMERA;
                }
                if single {
                    // No camera driver is attached to trigger a capture.
                    debug!(
                        "{}: ignoring single-shot camera image request",
                        self.client_info
                    );
                }
            }
            ApiMessage::ZWaveProxyFrame { data } => {
                if let Some(sink) = ctx.zwave_sink.as_mut() {
                    sink(data);
                } else {
                    debug!("{}: Z-Wave frame dropped, no proxy attached", self.client_info);
                }
            }
            other => {
                self.on_fatal_error(&format!("unexpected {}", other.name()));
            }
        }
    }

    fn on_hello(
        &mut self,
        ctx: &mut ApiContext,
        client_info: String,
        major: u32,
        minor: u32,
        now: Instant,
    ) {
        if self.phase != Phase::AwaitingHandshake {
            self.on_fatal_error("duplicate Hello");
            return;
        }
        self.client_info = format!("{client_info} ({})", self.peer);
        debug!(
            "Hello from {} (api {major}.{minor})",
            self.client_info
        );
        let response = ApiMessage::HelloResponse {
            api_version_major: 1,
            api_version_minor: 10,
            server_info: format!("emberlink v{}", env!("CARGO_PKG_VERSION")),
            name: ctx.name.clone(),
        };
        self.send_message(&response, ctx, now);
        self.phase = if ctx.password.is_some() {
            Phase::AwaitingAuth
        } else {
            Phase::Authenticated
        };
    }

    fn on_connect(&mut self, ctx: &mut ApiContext, password: String, now: Instant) {
        if self.phase == Phase::AwaitingHandshake {
            self.on_fatal_error("ConnectRequest before Hello");
            return;
        }
        let accepted = match &ctx.password {
            Some(stored) => check_password(stored, &password),
            None => true,
        };
        if accepted {
            self.send_message(&ApiMessage::ConnectResponse { invalid_password: false }, ctx, now);
            if self.phase != Phase::Authenticated {
                self.phase = Phase::Authenticated;
                info!("{}: connected", self.client_info);
            }
        } else {
            self.schedule_message_front(
                &ApiMessage::ConnectResponse { invalid_password: true },
                now,
            );
            self.on_fatal_error("invalid password");
        }
    }

    fn on_list_entities(&mut self, ctx: &mut ApiContext, now: Instant) {
        let entries: Vec<ApiMessage> = ctx
            .entities
            .iter_external()
            .map(|e| ApiMessage::ListEntitiesEntryResponse {
                kind: e.kind,
                key: e.key,
                object_id: e.object_id.clone(),
                name: e.name.clone(),
            })
            .collect();
        for entry in entries {
            self.send_message(&entry, ctx, now);
        }
        self.send_message(&ApiMessage::ListEntitiesDoneResponse, ctx, now);
    }

    fn send_all_states(&mut self, ctx: &mut ApiContext, now: Instant) {
        let states: Vec<ApiMessage> = ctx
            .entities
            .iter_external()
            .map(|e| ApiMessage::EntityStateResponse {
                key: e.key,
                state: e.state.clone(),
            })
            .collect();
        for state in states {
            self.send_message(&state, ctx, now);
        }
    }

    // --- Outbound batching ---

    /// Encodes and appends a message to the outbound batch buffer. The
    /// buffer is flushed when the batch delay elapses or the byte budget is
    /// exceeded; messages are never written synchronously per call.
    pub fn send_message(&mut self, msg: &ApiMessage, ctx: &ApiContext, now: Instant) {
        match codec::encode_frame(msg) {
            Ok(bytes) => self.enqueue_shared(bytes, now, ctx),
            Err(e) => self.on_fatal_error(&format!("encode error: {e}")),
        }
    }

    /// Appends pre-encoded frame bytes (shared across a fan-out) to the
    /// outbound batch buffer.
    pub fn enqueue_shared(&mut self, bytes: Bytes, now: Instant, ctx: &ApiContext) {
        if self.remove {
            return;
        }
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(bytes);
        if self.outbound_bytes > TX_BATCH_CAPACITY {
            self.flush(now);
        } else if self.flush_at.is_none() {
            self.flush_at = Some(now + ctx.batch_delay);
        }
    }

    /// Schedules a message at the *front* of the batch for priority delivery
    /// and attempts an immediate flush. Used for disconnect requests and
    /// auth rejections that must not wait out the batch delay.
    pub fn schedule_message_front(&mut self, msg: &ApiMessage, now: Instant) {
        let bytes = match codec::encode_frame(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.on_fatal_error(&format!("encode error: {e}"));
                return;
            }
        };
        self.outbound_bytes += bytes.len();
        // Never reorder in front of a partially-written frame.
        if self.write_offset > 0 && !self.outbound.is_empty() {
            self.outbound.insert(1, bytes);
        } else {
            self.outbound.push_front(bytes);
        }
        self.flush(now);
    }

    /// Writes as much of the outbound queue as the socket accepts. A full
    /// OS buffer leaves the remainder queued for the next tick; it is never
    /// dropped.
    pub fn flush(&mut self, now: Instant) {
        while let Some(front) = self.outbound.front() {
            let pending = &front[self.write_offset..];
            match io::try_write(&mut self.stream, pending) {
                Ok(IoOutcome::Transferred(n)) => {
                    self.write_offset += n;
                    if self.write_offset == front.len() {
                        self.outbound_bytes -= front.len();
                        self.outbound.pop_front();
                        self.write_offset = 0;
                    }
                }
                Ok(IoOutcome::WouldBlock) => {
                    // Retry on the next tick.
                    self.flush_at = Some(now);
                    return;
                }
                Ok(IoOutcome::Closed) => {
                    self.remove = true;
                    return;
                }
                Err(e) => {
                    self.on_fatal_error(&format!("write error: {e}"));
                    return;
                }
            }
        }
        self.flush_at = None;
    }

    /// True when every queued outbound byte has reached the socket.
    pub fn outbound_drained(&self) -> bool {
        self.outbound.is_empty()
    }

    // --- Keepalive ---

    fn keepalive(&mut self, ctx: &ApiContext, now: Instant) {
        if !self.is_authenticated() {
            return;
        }
        if self.pong_deadline.is_some_and(|deadline| now >= deadline) {
            self.on_fatal_error("ping timeout");
            return;
        }
        if now >= self.next_ping {
            self.send_message(&ApiMessage::PingRequest, ctx, now);
            self.next_ping = now + ctx.keepalive_interval;
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + ctx.keepalive_timeout);
            }
        }
    }
}

/// Message types an unauthenticated connection is allowed to send.
fn handshake_message(msg: &ApiMessage) -> bool {
    matches!(
        msg,
        ApiMessage::Hello { .. }
            | ApiMessage::ConnectRequest { .. }
            | ApiMessage::PingRequest
            | ApiMessage::PingResponse
            | ApiMessage::DisconnectRequest
            | ApiMessage::DisconnectResponse
            | ApiMessage::DeviceInfoRequest
    )
}

/// Compares an attempted password against the stored one in constant time
/// relative to the *attempt's* length.
///
/// The work done depends only on `attempt.len()`: when the lengths differ,
/// the attempt is compared against itself and the result forced to a
/// mismatch, so neither the stored length nor the position of the first
/// mismatching byte is observable through timing.
pub fn check_password(stored: &str, attempt: &str) -> bool {
    let a = stored.as_bytes();
    let b = attempt.as_bytes();

    let lengths_match = a.len() == b.len();
    let reference = if lengths_match { a } else { b };
    let mut result: u8 = u8::from(!lengths_match);

    for i in 0..b.len() {
        result |= reference[i] ^ b[i];
    }

    result == 0
}
