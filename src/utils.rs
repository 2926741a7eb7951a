use std::env;

use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

/// Print a fatal error with its whole cause chain.
///
/// The backtrace is included with debug logging or `RUST_BACKTRACE=1`.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP.
pub async fn wait_for_termination() -> Result<()> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
        _ = sig_hup.recv() => log::trace!("SIGHUP received"),
    }

    Ok(())
}
