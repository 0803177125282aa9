//! Graceful shutdown coordinator.
//!
//! The first SIGINT / SIGTERM / SIGHUP cancels the run token: the scheduler
//! stops launching transfers, lets in-flight ones finish, and the driver
//! reports the cursor to resume from. A second signal force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// Exit code used when a second signal interrupts draining.
const FORCE_EXIT_CODE: i32 = 130;

/// Install signal listeners and return the token they cancel.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let signals_seen = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate()).context("registering SIGTERM handler")?,
            signal(SignalKind::hangup()).context("registering SIGHUP handler")?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }

            if signals_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!(
                    "Shutdown requested: no new transfers will start, waiting for in-flight ones"
                );
                tracing::info!("Send the signal again to abort immediately");
                handler_token.cancel();
            } else {
                tracing::warn!("Second shutdown signal, aborting in-flight transfers");
                std::process::exit(FORCE_EXIT_CODE);
            }
        }
    });

    Ok(token)
}
