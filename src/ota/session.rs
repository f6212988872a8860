// src/ota/session.rs

//! One OTA client session, from magic bytes to reboot.
//!
//! The magic handshake is polled nonblockingly so an idle or garbage
//! connection never stalls the event loop. Once the magic matches, the
//! rest of the transfer runs to completion in a single call, busy-polling
//! the socket with short sleeps and feeding the watchdog while it does.

use crate::config::{AuthCompat, OtaConfig};
use crate::core::io::{self, IoOutcome};
use crate::device::DeviceControl;
use crate::ota::auth;
use crate::ota::backend::OtaBackend;
use crate::ota::events::OtaEvent;
use crate::ota::{
    CHUNK_BUFFER_SIZE, DATA_TIMEOUT, FEATURE_SUPPORTS_COMPRESSION, FEATURE_SUPPORTS_SHA256_AUTH,
    HANDSHAKE_TIMEOUT, MAGIC_BYTES, OTA_BLOCK_SIZE, OtaResponse,
};
use md5::Md5;
use sha2::Sha256;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between socket polls while waiting inside the transfer.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long a terminal error code may wait for socket space before it is
/// given up on.
const ERROR_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of one magic-handshake poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicPoll {
    /// Not enough bytes yet; poll again next tick.
    Pending,
    /// The magic matched; the session is ready for the transfer.
    Ready,
    /// Wrong magic, timeout, or socket failure. Drop the session.
    Failed,
}

pub struct OtaSession {
    stream: TcpStream,
    peer: String,
    magic_buf: [u8; 5],
    magic_pos: usize,
    connected_at: Instant,
}

impl OtaSession {
    pub fn new(stream: TcpStream, peer: String, now: Instant) -> Self {
        Self {
            stream,
            peer,
            magic_buf: [0; 5],
            magic_pos: 0,
            connected_at: now,
        }
    }

    /// Advances the magic handshake without blocking.
    pub fn poll_magic(&mut self, now: Instant) -> MagicPoll {
        while self.magic_pos < MAGIC_BYTES.len() {
            match io::try_read(&mut self.stream, &mut self.magic_buf[self.magic_pos..]) {
                Ok(IoOutcome::Transferred(n)) => self.magic_pos += n,
                Ok(IoOutcome::WouldBlock) => {
                    if now.duration_since(self.connected_at) > HANDSHAKE_TIMEOUT {
                        warn!("OTA {}: no magic within timeout", self.peer);
                        return MagicPoll::Failed;
                    }
                    return MagicPoll::Pending;
                }
                Ok(IoOutcome::Closed) => {
                    debug!("OTA {}: closed before magic", self.peer);
                    return MagicPoll::Failed;
                }
                Err(e) => {
                    warn!("OTA {}: read failed during magic: {e}", self.peer);
                    return MagicPoll::Failed;
                }
            }
        }
        if self.magic_buf != MAGIC_BYTES {
            warn!(
                "OTA {}: magic mismatch: {:02X?}",
                self.peer, self.magic_buf
            );
            // Tell the client why, then give up on this session.
            self.send_error_code(OtaResponse::ErrorMagic);
            return MagicPoll::Failed;
        }
        MagicPoll::Ready
    }

    /// Writes a single terminal error code, waiting out transient
    /// `WouldBlock` until [`ERROR_SEND_TIMEOUT`]. Synchronous because the
    /// magic handshake runs outside the transfer's async helpers.
    fn send_error_code(&mut self, code: OtaResponse) {
        let deadline = Instant::now() + ERROR_SEND_TIMEOUT;
        loop {
            match io::try_write(&mut self.stream, &[code.as_byte()]) {
                Ok(IoOutcome::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                // Written, closed, or failed; nothing more to do either way.
                _ => return,
            }
        }
    }

    /// Runs the transfer to completion. Consumes the session; the outcome
    /// is reported through `notify` and the log.
    pub async fn transfer(
        mut self,
        config: &OtaConfig,
        device: &dyn DeviceControl,
        backend: &mut dyn OtaBackend,
        notify: &mut dyn FnMut(OtaEvent),
    ) {
        let mut update_started = false;
        let mut finalized = false;
        let result = self
            .run(config, device, backend, notify, &mut update_started, &mut finalized)
            .await;
        if let Err(code) = result {
            // Best effort: the socket may already be gone, but a congested
            // one still gets the code within the send timeout.
            let _ = self
                .write_all(
                    &[code.as_byte()],
                    Instant::now() + ERROR_SEND_TIMEOUT,
                    device,
                )
                .await;
            if update_started && !finalized {
                backend.abort();
            }
            warn!(
                "OTA {}: update failed with code 0x{:02X}",
                self.peer,
                code.as_byte()
            );
            notify(OtaEvent::Error {
                code: code.as_byte(),
            });
        }
    }

    async fn run(
        &mut self,
        config: &OtaConfig,
        device: &dyn DeviceControl,
        backend: &mut dyn OtaBackend,
        notify: &mut dyn FnMut(OtaEvent),
        update_started: &mut bool,
        finalized: &mut bool,
    ) -> Result<(), OtaResponse> {
        info!("OTA {}: starting update", self.peer);
        notify(OtaEvent::Started);
        let handshake_deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        // Acknowledge the magic and announce the protocol version.
        self.write_all(
            &[OtaResponse::Ok.as_byte(), config.version],
            handshake_deadline,
            device,
        )
        .await?;

        let mut byte = [0u8; 1];
        self.read_exact(&mut byte, handshake_deadline, device).await?;
        let features = byte[0];
        debug!("OTA {}: features 0x{:02X}", self.peer, features);

        let compressed =
            features & FEATURE_SUPPORTS_COMPRESSION != 0 && backend.supports_compression();
        let header_ack = if compressed {
            OtaResponse::SupportsCompression
        } else {
            OtaResponse::HeaderOk
        };
        self.write_all(&[header_ack.as_byte()], handshake_deadline, device)
            .await?;

        if let Some(password) = &config.password {
            if features & FEATURE_SUPPORTS_SHA256_AUTH != 0 {
                auth::perform_hash_auth::<Sha256>(
                    self,
                    device,
                    password,
                    OtaResponse::RequestSha256Auth,
                )
                .await?;
            } else {
                match config.auth_compat {
                    AuthCompat::AllowMd5Fallback => {
                        warn!(
                            "OTA {}: client lacks SHA-256 support, using deprecated MD5 auth",
                            self.peer
                        );
                        auth::perform_hash_auth::<Md5>(
                            self,
                            device,
                            password,
                            OtaResponse::RequestAuth,
                        )
                        .await?;
                    }
                    AuthCompat::Sha256Strict => {
                        warn!(
                            "OTA {}: rejecting client without SHA-256 auth support",
                            self.peer
                        );
                        return Err(OtaResponse::ErrorAuthInvalid);
                    }
                }
            }
        }

        // Image size, 4 bytes big-endian.
        let mut size_buf = [0u8; 4];
        self.read_exact(&mut size_buf, handshake_deadline, device)
            .await?;
        let total_size = u32::from_be_bytes(size_buf) as usize;
        info!("OTA {}: image size is {total_size} bytes", self.peer);

        backend.begin(total_size).map_err(|code| {
            warn!("OTA {}: preparing for update failed", self.peer);
            code
        })?;
        *update_started = true;
        self.write_all(
            &[OtaResponse::UpdatePrepareOk.as_byte()],
            handshake_deadline,
            device,
        )
        .await?;

        // Announced MD5 of the image, 32 hex chars.
        let mut md5_buf = [0u8; 32];
        self.read_exact(&mut md5_buf, handshake_deadline, device)
            .await?;
        let md5_hex =
            std::str::from_utf8(&md5_buf).map_err(|_| OtaResponse::ErrorMd5Mismatch)?;
        debug!("OTA {}: image MD5 is {md5_hex}", self.peer);
        backend.set_update_md5(md5_hex);
        self.write_all(&[OtaResponse::BinMd5Ok.as_byte()], handshake_deadline, device)
            .await?;

        // Data phase. The deadline refreshes on every read so a slow but
        // live client is never cut off.
        let mut buf = [0u8; CHUNK_BUFFER_SIZE];
        let mut total = 0usize;
        let mut acknowledged = 0usize;
        let mut last_progress = Instant::now();
        while total < total_size {
            let want = (total_size - total).min(CHUNK_BUFFER_SIZE);
            let n = self
                .read_some(&mut buf[..want], Instant::now() + DATA_TIMEOUT, device)
                .await?;
            backend.write(&buf[..n]).map_err(|code| {
                warn!("OTA {}: writing image data failed", self.peer);
                code
            })?;
            total += n;

            if config.version >= 2 {
                // Acknowledge each full block; the tail of the image is
                // acknowledged once the final byte lands.
                while acknowledged + OTA_BLOCK_SIZE <= total
                    || (total == total_size && acknowledged < total_size)
                {
                    self.write_all(
                        &[OtaResponse::ChunkOk.as_byte()],
                        Instant::now() + DATA_TIMEOUT,
                        device,
                    )
                    .await?;
                    acknowledged += OTA_BLOCK_SIZE;
                }
            }

            let now = Instant::now();
            if now.duration_since(last_progress) >= Duration::from_secs(1) {
                last_progress = now;
                let percent = total as f32 / total_size as f32 * 100.0;
                debug!("OTA {}: {percent:.1}%", self.peer);
                notify(OtaEvent::InProgress { percent });
            }
        }
        debug!("OTA {}: reception complete", self.peer);

        let final_deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        self.write_all(&[OtaResponse::ReceiveOk.as_byte()], final_deadline, device)
            .await?;

        backend.end().map_err(|code| {
            warn!("OTA {}: finalizing image failed", self.peer);
            code
        })?;
        *finalized = true;
        self.write_all(&[OtaResponse::UpdateEndOk.as_byte()], final_deadline, device)
            .await?;

        // The client confirms with one last byte; its loss is harmless.
        let mut ack = [0u8; 1];
        let _ = self
            .read_exact(&mut ack, Instant::now() + Duration::from_millis(250), device)
            .await;

        info!("OTA {}: update complete", self.peer);
        notify(OtaEvent::Completed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        device.safe_reboot("firmware image received");
        Ok(())
    }

    // --- Deadline-bounded socket helpers ---
    //
    // These busy-poll with a short sleep instead of registering interest,
    // because a transfer in progress owns the loop anyway. The watchdog is
    // fed on every wait.

    pub(crate) async fn read_exact(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        device: &dyn DeviceControl,
    ) -> Result<(), OtaResponse> {
        let mut filled = 0;
        while filled < buf.len() {
            match io::try_read(&mut self.stream, &mut buf[filled..]) {
                Ok(IoOutcome::Transferred(n)) => filled += n,
                Ok(IoOutcome::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("OTA {}: read timed out", self.peer);
                        return Err(OtaResponse::ErrorUnknown);
                    }
                    device.feed_watchdog();
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(IoOutcome::Closed) => {
                    warn!("OTA {}: closed mid-read", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
                Err(e) => {
                    warn!("OTA {}: read failed: {e}", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
            }
        }
        Ok(())
    }

    /// Reads at least one byte, up to `buf.len()`.
    async fn read_some(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        device: &dyn DeviceControl,
    ) -> Result<usize, OtaResponse> {
        loop {
            match io::try_read(&mut self.stream, buf) {
                Ok(IoOutcome::Transferred(n)) => return Ok(n),
                Ok(IoOutcome::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("OTA {}: read timed out", self.peer);
                        return Err(OtaResponse::ErrorUnknown);
                    }
                    device.feed_watchdog();
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(IoOutcome::Closed) => {
                    warn!("OTA {}: closed mid-read", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
                Err(e) => {
                    warn!("OTA {}: read failed: {e}", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
            }
        }
    }

    pub(crate) async fn write_all(
        &mut self,
        buf: &[u8],
        deadline: Instant,
        device: &dyn DeviceControl,
    ) -> Result<(), OtaResponse> {
        let mut written = 0;
        while written < buf.len() {
            match io::try_write(&mut self.stream, &buf[written..]) {
                Ok(IoOutcome::Transferred(n)) => written += n,
                Ok(IoOutcome::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("OTA {}: write timed out", self.peer);
                        return Err(OtaResponse::ErrorUnknown);
                    }
                    device.feed_watchdog();
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(IoOutcome::Closed) => {
                    warn!("OTA {}: closed mid-write", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
                Err(e) => {
                    warn!("OTA {}: write failed: {e}", self.peer);
                    return Err(OtaResponse::ErrorUnknown);
                }
            }
        }
        Ok(())
    }
}
