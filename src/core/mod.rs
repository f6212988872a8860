// src/core/mod.rs

//! Core types shared by the API server and the OTA receiver.

pub mod errors;
pub mod io;

pub use errors::EmberlinkError;
