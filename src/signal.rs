//! SIGINT/SIGTERM teardown.
//!
//! Installed once when the runtime is hosted inside a long-running
//! server. On `SIGINT`/`SIGTERM`, tears down the device manager and
//! re-raises the signal's default disposition so a debugger or shell
//! attached to the process still observes the normal kill.

use std::sync::Once;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::error::{Error, Result};
use crate::manager::DeviceManager;

static INSTALL: Once = Once::new();

/// Spawn the background thread that watches for `SIGINT`/`SIGTERM` and
/// runs [`DeviceManager::clear_from_global_state`]. Idempotent: calling
/// this more than once only installs the watcher thread on the first
/// call.
pub fn install() -> Result<()> {
    let mut result = Ok(());
    INSTALL.call_once(|| {
        result = spawn_handler();
    });
    result
}

fn spawn_handler() -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| Error::Internal(format!("installing SIGINT/SIGTERM handler: {}", e)))?;

    std::thread::Builder::new()
        .name("npu-runtime-signal".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                tracing::warn!(signal = sig, "fatal signal received, tearing down device manager");
                DeviceManager::clear_from_global_state();
                reraise_default(sig);
            }
        })
        .map_err(|e| Error::Internal(format!("spawning signal watcher thread: {}", e)))?;

    Ok(())
}

/// Restore the signal's default disposition and re-deliver it to this
/// process, so the process still exits/terminates the way it would have
/// without this handler installed.
fn reraise_default(sig: i32) {
    use nix::sys::signal::{self, SigHandler, Signal};

    let Ok(signal) = Signal::try_from(sig) else {
        return;
    };
    unsafe {
        let _ = signal::signal(signal, SigHandler::SigDfl);
    }
    let _ = signal::raise(signal);
}
