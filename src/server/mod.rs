// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod context;
mod event_loop;
mod initialization;

pub use context::ServerContext;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Bind sockets and initialize all components.
    let ctx = initialization::setup(config)?;

    // 2. Drive the cooperative tick loop. This function runs until shutdown.
    event_loop::run(ctx).await;

    Ok(())
}
