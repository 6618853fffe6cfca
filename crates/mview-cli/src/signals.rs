//! Process signals that stop an update pass between chunks.

use anyhow::{Context as _, Result};
use mview_core::CancelToken;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

/// Signals that request a graceful stop.
pub const STOP_SIGNALS: [i32; 4] = [SIGINT, SIGTERM, SIGQUIT, SIGHUP];

/// Route the stop signals to `cancel`. The default terminate action is
/// replaced, so the pass restores the view before the process exits.
pub fn install(cancel: &CancelToken) -> Result<()> {
    for signal in STOP_SIGNALS {
        signal_hook::flag::register(signal, cancel.flag())
            .with_context(|| format!("register handler for signal {signal}"))?;
    }
    Ok(())
}
