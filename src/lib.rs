// src/lib.rs

pub mod api;
pub mod config;
pub mod core;
pub mod device;
pub mod ota;
pub mod server;

// Re-export
pub use crate::core::EmberlinkError;
