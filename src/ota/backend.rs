// src/ota/backend.rs

//! Storage backends for received firmware images.
//!
//! The session drives a backend through a strict lifecycle: `begin`, any
//! number of `write`s, then exactly one of `end` or `abort`. Errors are
//! reported as the wire code the client should see.

use crate::ota::OtaResponse;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A place to put firmware bytes as they arrive.
pub trait OtaBackend: Send {
    /// Prepares storage for an image of `size` bytes.
    fn begin(&mut self, size: usize) -> Result<(), OtaResponse>;

    /// Appends received bytes to the image.
    fn write(&mut self, data: &[u8]) -> Result<(), OtaResponse>;

    /// Records the MD5 digest (32 hex chars) the finished image must have.
    fn set_update_md5(&mut self, md5_hex: &str);

    /// Verifies and commits the image. Must be called at most once after a
    /// successful `begin`, and never after `abort`.
    fn end(&mut self) -> Result<(), OtaResponse>;

    /// Discards a partially received image. Must be called exactly once
    /// when a started update does not reach a successful `end`.
    fn abort(&mut self);

    /// Whether this backend can decompress images on the fly.
    fn supports_compression(&self) -> bool {
        false
    }
}

struct InFlight {
    file: File,
    part_path: PathBuf,
    hasher: Md5,
    expected_size: usize,
    written: usize,
    expected_md5: Option<String>,
}

/// Backend that stages the image as a file under a staging directory. The
/// image is written to a `.part` file and renamed into place only after
/// the MD5 check passes.
pub struct FileBackend {
    staging_dir: PathBuf,
    in_flight: Option<InFlight>,
}

impl FileBackend {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            in_flight: None,
        }
    }

    fn final_path(&self) -> PathBuf {
        self.staging_dir.join("firmware.bin")
    }

    fn part_path(&self) -> PathBuf {
        self.staging_dir.join("firmware.bin.part")
    }
}

impl OtaBackend for FileBackend {
    fn begin(&mut self, size: usize) -> Result<(), OtaResponse> {
        if self.in_flight.is_some() {
            warn!("OTA begin while another image is in flight");
            return Err(OtaResponse::ErrorUpdatePrepare);
        }
        if let Err(e) = fs::create_dir_all(&self.staging_dir) {
            warn!("Cannot create staging dir: {e}");
            return Err(OtaResponse::ErrorUpdatePrepare);
        }
        let part_path = self.part_path();
        let file = match File::create(&part_path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot create staging file: {e}");
                return Err(OtaResponse::ErrorUpdatePrepare);
            }
        };
        debug!("Staging firmware image at {}", part_path.display());
        self.in_flight = Some(InFlight {
            file,
            part_path,
            hasher: Md5::new(),
            expected_size: size,
            written: 0,
            expected_md5: None,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaResponse> {
        let Some(inflight) = self.in_flight.as_mut() else {
            return Err(OtaResponse::ErrorWritingFlash);
        };
        if let Err(e) = inflight.file.write_all(data) {
            warn!("Staging file write failed: {e}");
            return Err(OtaResponse::ErrorWritingFlash);
        }
        inflight.hasher.update(data);
        inflight.written += data.len();
        Ok(())
    }

    fn set_update_md5(&mut self, md5_hex: &str) {
        if let Some(inflight) = self.in_flight.as_mut() {
            inflight.expected_md5 = Some(md5_hex.to_ascii_lowercase());
        }
    }

    fn end(&mut self) -> Result<(), OtaResponse> {
        let Some(inflight) = self.in_flight.take() else {
            return Err(OtaResponse::ErrorUpdateEnd);
        };
        if inflight.written != inflight.expected_size {
            warn!(
                "Image truncated: got {} of {} bytes",
                inflight.written, inflight.expected_size
            );
            let _ = fs::remove_file(&inflight.part_path);
            return Err(OtaResponse::ErrorUpdateEnd);
        }
        let actual = hex::encode(inflight.hasher.finalize());
        match &inflight.expected_md5 {
            Some(expected) if *expected == actual => {}
            Some(expected) => {
                warn!("Image MD5 mismatch: expected {expected}, got {actual}");
                let _ = fs::remove_file(&inflight.part_path);
                return Err(OtaResponse::ErrorMd5Mismatch);
            }
            None => {
                warn!("No MD5 announced for image");
                let _ = fs::remove_file(&inflight.part_path);
                return Err(OtaResponse::ErrorUpdateEnd);
            }
        }
        if let Err(e) = inflight.file.sync_all() {
            warn!("Staging file sync failed: {e}");
            let _ = fs::remove_file(&inflight.part_path);
            return Err(OtaResponse::ErrorUpdateEnd);
        }
        let final_path = self.final_path();
        if let Err(e) = fs::rename(&inflight.part_path, &final_path) {
            warn!("Cannot move staged image into place: {e}");
            let _ = fs::remove_file(&inflight.part_path);
            return Err(OtaResponse::ErrorUpdateEnd);
        }
        debug!("Firmware image committed to {}", final_path.display());
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(inflight) = self.in_flight.take() {
            debug!("Discarding partial image ({} bytes)", inflight.written);
            drop(inflight.file);
            let _ = fs::remove_file(&inflight.part_path);
        }
    }
}
