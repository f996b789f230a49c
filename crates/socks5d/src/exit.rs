//! Detect the signals that tell us to exit, pause or resume.

use anyhow::Result;
use socks5_server::Server;
use tracing::info;

/// Wait until a control-c notification is received.
///
/// See the documentation for `tokio::signal::ctrl_c` for caveats.
pub(crate) async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Pause `server` on SIGUSR1, and resume it on SIGUSR2.
///
/// Runs forever, unless the signal streams end.
#[cfg(unix)]
pub(crate) async fn pause_on_signal(server: Server) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pause = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;
    loop {
        tokio::select! {
            Some(()) = pause.recv() => {
                info!("Got SIGUSR1: no longer accepting connections.");
                server.pause();
            }
            Some(()) = resume.recv() => {
                info!("Got SIGUSR2: accepting connections again.");
                server.resume();
            }
            else => return Ok(()),
        }
    }
}

/// Pausing by signal is only supported on unix; elsewhere, wait forever.
#[cfg(not(unix))]
pub(crate) async fn pause_on_signal(_server: Server) -> Result<()> {
    futures::future::pending().await
}
