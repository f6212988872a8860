// src/ota/mod.rs

//! The OTA firmware receiver.
//!
//! Speaks the binary OTA protocol on its own port: magic handshake,
//! challenge-response authentication, size and MD5 exchange, then the
//! chunked firmware transfer with per-block acknowledgments in protocol
//! version 2. A transfer in progress monopolizes the event loop on
//! purpose; every other activity is suspended until it settles.

pub mod auth;
pub mod backend;
pub mod events;
pub mod server;
pub mod session;

pub use backend::{FileBackend, OtaBackend};
pub use events::{OtaEvent, OtaObserver};
pub use server::OtaServer;

use std::time::Duration;

/// The five magic bytes a client must send first.
pub const MAGIC_BYTES: [u8; 5] = [0x6C, 0x26, 0xF7, 0x5C, 0x45];

/// Feature bit: the client can send a compressed image.
pub const FEATURE_SUPPORTS_COMPRESSION: u8 = 0x01;
/// Feature bit: the client supports SHA-256 challenge-response auth.
pub const FEATURE_SUPPORTS_SHA256_AUTH: u8 = 0x02;

/// Bytes of firmware covered by one version-2 block acknowledgment.
pub const OTA_BLOCK_SIZE: usize = 8192;

/// Size of the read buffer used during the data phase.
pub const CHUNK_BUFFER_SIZE: usize = 1024;

/// Deadline for each handshake step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline refreshed on every read during the data phase.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(90);

/// Single-byte status codes written to the client. Values at or above
/// 0x80 are errors and terminate the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaResponse {
    Ok = 0x00,
    RequestAuth = 0x01,
    RequestSha256Auth = 0x02,
    HeaderOk = 0x40,
    AuthOk = 0x41,
    UpdatePrepareOk = 0x42,
    BinMd5Ok = 0x43,
    ReceiveOk = 0x44,
    UpdateEndOk = 0x45,
    SupportsCompression = 0x46,
    ChunkOk = 0x47,
    ErrorMagic = 0x80,
    ErrorUpdatePrepare = 0x81,
    ErrorAuthInvalid = 0x82,
    ErrorWritingFlash = 0x83,
    ErrorUpdateEnd = 0x84,
    ErrorMd5Mismatch = 0x8B,
    ErrorUnknown = 0xFF,
}

impl OtaResponse {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_error(self) -> bool {
        self.as_byte() >= 0x80
    }
}
