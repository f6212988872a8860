// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum EmberlinkError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame payload exceeds protocol limit")]
    FrameTooLarge,

    #[error("Authentication required")]
    AuthRequired,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Unknown service key '{0}'")]
    UnknownService(u32),

    #[error("Wrong number of arguments for service '{0}'")]
    WrongArgumentCount(String),

    #[error("Wrong argument type for service '{0}'")]
    WrongArgumentType(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for EmberlinkError {
    fn clone(&self) -> Self {
        match self {
            EmberlinkError::Io(e) => EmberlinkError::Io(Arc::clone(e)),
            EmberlinkError::IncompleteData => EmberlinkError::IncompleteData,
            EmberlinkError::ProtocolViolation(s) => EmberlinkError::ProtocolViolation(s.clone()),
            EmberlinkError::FrameTooLarge => EmberlinkError::FrameTooLarge,
            EmberlinkError::AuthRequired => EmberlinkError::AuthRequired,
            EmberlinkError::InvalidPassword => EmberlinkError::InvalidPassword,
            EmberlinkError::UnknownService(k) => EmberlinkError::UnknownService(*k),
            EmberlinkError::WrongArgumentCount(s) => EmberlinkError::WrongArgumentCount(s.clone()),
            EmberlinkError::WrongArgumentType(s) => EmberlinkError::WrongArgumentType(s.clone()),
            EmberlinkError::InvalidState(s) => EmberlinkError::InvalidState(s.clone()),
            EmberlinkError::Internal(s) => EmberlinkError::Internal(s.clone()),
        }
    }
}

impl PartialEq for EmberlinkError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EmberlinkError::Io(e1), EmberlinkError::Io(e2)) => e1.to_string() == e2.to_string(),
            (EmberlinkError::ProtocolViolation(s1), EmberlinkError::ProtocolViolation(s2)) => {
                s1 == s2
            }
            (EmberlinkError::UnknownService(k1), EmberlinkError::UnknownService(k2)) => k1 == k2,
            (EmberlinkError::WrongArgumentCount(s1), EmberlinkError::WrongArgumentCount(s2)) => {
                s1 == s2
            }
            (EmberlinkError::WrongArgumentType(s1), EmberlinkError::WrongArgumentType(s2)) => {
                s1 == s2
            }
            (EmberlinkError::InvalidState(s1), EmberlinkError::InvalidState(s2)) => s1 == s2,
            (EmberlinkError::Internal(s1), EmberlinkError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for EmberlinkError {
    fn from(e: std::io::Error) -> Self {
        EmberlinkError::Io(Arc::new(e))
    }
}

impl From<bincode::error::EncodeError> for EmberlinkError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EmberlinkError::Internal(format!("Payload encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for EmberlinkError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EmberlinkError::ProtocolViolation(format!("Payload decode error: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for EmberlinkError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        EmberlinkError::ProtocolViolation(format!("Invalid UTF-8: {e}"))
    }
}
