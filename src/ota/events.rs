// src/ota/events.rs

//! Observer notifications for the OTA lifecycle.

/// A state change of the OTA receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaEvent {
    /// A client passed the magic handshake and a transfer is beginning.
    Started,
    /// Progress report, emitted at most once per second.
    InProgress { percent: f32 },
    /// The firmware image was received, verified, and finalized.
    Completed,
    /// The transfer failed with the given wire error code.
    Error { code: u8 },
}

/// Receives OTA lifecycle notifications. Observers must not block; they
/// run on the single event-loop thread mid-transfer.
pub trait OtaObserver: Send {
    fn on_event(&mut self, event: &OtaEvent);
}
