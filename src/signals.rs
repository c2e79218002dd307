use crate::process::{ChildProcess, ProcessError};
use crate::service::Registry;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct SignalCoordinator;

impl SignalCoordinator {
    /// Cancels `token` on the first SIGINT or SIGTERM. Later signals are only
    /// logged, teardown is already underway.
    pub fn install(token: CancellationToken) -> Result<JoinHandle<()>> {
        let mut interrupt =
            signal(SignalKind::interrupt()).wrap_err("Failed to listen for SIGINT")?;
        let mut terminate =
            signal(SignalKind::terminate()).wrap_err("Failed to listen for SIGTERM")?;

        Ok(tokio::spawn(
            async move {
                loop {
                    let name = tokio::select! {
                        Some(()) = interrupt.recv() => "SIGINT",
                        Some(()) = terminate.recv() => "SIGTERM",
                        else => break,
                    };
                    if token.is_cancelled() {
                        warn!("Received {name} while stopping, already shutting down");
                    } else {
                        info!("Received {name}, stopping all services...");
                        token.cancel();
                    }
                }
            }
            .instrument(info_span!("signals")),
        ))
    }

    /// Sends `signal` to the process group of every live handle. Handles
    /// already recorded as exited are skipped, their pgid may have been
    /// reused. Groups that vanished meanwhile are skipped silently. Returns
    /// how many groups were signalled.
    pub fn cascade<C: ChildProcess>(registry: &Registry<C>, signal: Signal) -> usize {
        let mut signalled = 0;
        for handle in registry.handles().filter(|h| h.is_alive()) {
            match handle.signal_group(signal) {
                Ok(()) => {
                    debug!(service = %handle.service, pgid = handle.pgid, ?signal, "Signalled process group");
                    signalled += 1;
                }
                Err(ProcessError::NoSuchProcess) => {}
                Err(err) => {
                    warn!(?err, service = %handle.service, "Failed to signal process group");
                }
            }
        }
        signalled
    }
}
