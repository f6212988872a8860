// src/server/event_loop.rs

//! Contains the cooperative tick loop and graceful shutdown handling.
//!
//! Everything runs on one task: each tick steps the API server (accepts,
//! per-connection state machines, fan-out flushing) and the OTA server.
//! An OTA transfer that passes its magic handshake intentionally holds the
//! loop until it finishes; nothing else is serviced meanwhile.

use super::context::ServerContext;
use anyhow::anyhow;
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Tick granularity of the event loop. Bounds batching latency jitter, so
/// it stays well below the smallest configurable batch delay.
const TICK_INTERVAL: Duration = Duration::from_millis(8);

/// How long shutdown waits for clients to drain and disconnect.
const TEARDOWN_LIMIT: Duration = Duration::from_secs(3);

/// The main loop. Runs until a signal arrives or the device requests a
/// reboot, then drains API connections before returning.
pub async fn run(mut ctx: ServerContext) {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))
        .expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))
        .expect("Failed to create SIGTERM stream");

    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            _ = interval.tick() => {
                let now = Instant::now();
                ctx.api.tick(&*ctx.network, now);
                ctx.ota.tick(now).await;

                if ctx.device.reboot_requested() {
                    info!("Reboot requested, leaving the event loop.");
                    break;
                }
            }
        }
    }

    info!("Shutting down.");
    ctx.ota.on_shutdown();
    ctx.api.on_shutdown();

    // Keep ticking so disconnect requests actually reach the sockets.
    let teardown_deadline = Instant::now() + TEARDOWN_LIMIT;
    loop {
        if ctx.api.teardown(&*ctx.network, Instant::now()) {
            break;
        }
        if Instant::now() >= teardown_deadline {
            warn!(
                "Timed out waiting for {} API client(s) to disconnect cleanly.",
                ctx.api.client_count()
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    info!("Server shutdown complete.");
}
