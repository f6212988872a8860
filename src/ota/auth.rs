// src/ota/auth.rs

//! Challenge-response authentication for OTA sessions.
//!
//! The same exchange runs for every hash: the receiver sends a nonce, the
//! client answers with its own cnonce plus `hash(password ‖ nonce ‖ cnonce)`
//! in hex, and the receiver checks the digest. Which hash is used depends on
//! the client's advertised features and the configured compatibility policy.

use crate::device::DeviceControl;
use crate::ota::session::OtaSession;
use crate::ota::{HANDSHAKE_TIMEOUT, OtaResponse};
use md5::Digest;
use rand::RngCore;
use std::time::Instant;
use tracing::{debug, warn};

/// Runs one challenge-response exchange with the digest `D`.
///
/// The caller picks `D` and the matching request byte; everything else is
/// derived from the digest's output size.
pub(crate) async fn perform_hash_auth<D: Digest>(
    session: &mut OtaSession,
    device: &dyn DeviceControl,
    password: &str,
    request: OtaResponse,
) -> Result<(), OtaResponse> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    session
        .write_all(&[request.as_byte()], deadline, device)
        .await?;

    let digest_len = <D as Digest>::output_size();
    let hex_len = digest_len * 2;

    // Server nonce: a short random seed run through the digest, hex-encoded.
    let mut seed = vec![0u8; digest_len / 4];
    rand::thread_rng().fill_bytes(&mut seed);
    let nonce = hex::encode(D::digest(&seed));
    debug!("Auth nonce is {nonce}");
    session
        .write_all(nonce.as_bytes(), deadline, device)
        .await?;

    let mut cnonce_buf = vec![0u8; hex_len];
    session
        .read_exact(&mut cnonce_buf, deadline, device)
        .await?;
    let cnonce =
        std::str::from_utf8(&cnonce_buf).map_err(|_| OtaResponse::ErrorAuthInvalid)?;
    debug!("Auth cnonce is {cnonce}");

    let mut hasher = D::new();
    hasher.update(password.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(cnonce.as_bytes());
    let expected = hex::encode(hasher.finalize());

    let mut response_buf = vec![0u8; hex_len];
    session
        .read_exact(&mut response_buf, deadline, device)
        .await?;

    if !digests_match(expected.as_bytes(), &response_buf) {
        warn!("Auth response mismatch");
        return Err(OtaResponse::ErrorAuthInvalid);
    }
    session
        .write_all(&[OtaResponse::AuthOk.as_byte()], deadline, device)
        .await?;
    Ok(())
}

/// Compares two equal-length digests without short-circuiting on the first
/// differing byte.
fn digests_match(expected: &[u8], received: &[u8]) -> bool {
    if expected.len() != received.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (a, b) in expected.iter().zip(received.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
