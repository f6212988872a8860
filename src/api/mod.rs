// src/api/mod.rs

//! The framed TCP API: state synchronization and remote procedure calls
//! for many concurrent clients over a single-threaded event loop.

pub mod codec;
pub mod connection;
pub mod entities;
pub mod frame;
pub mod message;
pub mod server;
pub mod services;

pub use connection::Connection;
pub use frame::{Frame, FrameCodec};
pub use message::ApiMessage;
pub use server::ApiServer;
