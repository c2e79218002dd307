use crate::configs::LaunchProperties;
use crate::process::{ChildProcess, ProcessError, ProcessState, Spawner};
use crate::service::{ProcessHandle, ServiceDescriptor};
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Starts one service with a bounded number of attempts. Liveness is judged
/// by survival through the settle window, readiness is checked elsewhere.
pub struct ServiceLauncher<S> {
    spawner: S,
    max_attempts: u32,
    settle: Duration,
    backoff: Duration,
}

impl<S: Spawner> ServiceLauncher<S> {
    pub fn new(spawner: S, properties: &LaunchProperties) -> Self {
        Self {
            spawner,
            max_attempts: properties.max_attempts.max(1),
            settle: properties.settle,
            backoff: properties.backoff,
        }
    }

    #[instrument(skip_all, fields(service = %service.name))]
    pub async fn launch(
        &self,
        service: &ServiceDescriptor,
        cancel: &CancellationToken,
    ) -> Option<ProcessHandle<S::Child>> {
        for attempt in 1..=self.max_attempts {
            info!(
                "Starting {} (attempt {attempt}/{})...",
                service.name, self.max_attempts
            );
            match self.spawner.spawn(service) {
                Ok(child) => {
                    let mut handle = ProcessHandle::new(service.name.as_str(), child);

                    tokio::select! {
                        _ = sleep(self.settle) => {}
                        _ = cancel.cancelled() => {
                            info!("Shutdown requested, abandoning start of {}", service.name);
                            abandon(&mut handle);
                            return None;
                        }
                    }

                    match handle.poll_exit() {
                        None => {
                            handle.state = ProcessState::Running;
                            info!(pid = handle.pid, "{} started successfully", service.name);
                            return Some(handle);
                        }
                        Some(exit_code) => {
                            warn!(
                                exit_code,
                                "{} failed to start. Output: {}",
                                service.name,
                                handle.output().trim_end()
                            );
                            discard(&handle);
                        }
                    }
                }
                Err(err) => {
                    error!(?err, "Error starting {} (attempt {attempt})", service.name);
                }
            }

            if attempt < self.max_attempts {
                info!(
                    "Retrying {} in {}",
                    service.name,
                    humantime::format_duration(self.backoff)
                );
                tokio::select! {
                    _ = sleep(self.backoff) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }

        error!(
            "Failed to start {} after {} attempts",
            service.name, self.max_attempts
        );
        None
    }
}

/// The leader is gone but anything it left behind in the group could still
/// hold the port the retry needs.
fn discard<C: ChildProcess>(handle: &ProcessHandle<C>) {
    match handle.signal_group(Signal::SIGKILL) {
        Ok(()) => debug!(pgid = handle.pgid, "Killed leftovers of failed attempt"),
        Err(ProcessError::NoSuchProcess) => {}
        Err(err) => warn!(?err, "Failed to kill leftovers of failed attempt"),
    }
}

fn abandon<C: ChildProcess>(handle: &mut ProcessHandle<C>) {
    if let Err(err) = handle.signal_group(Signal::SIGTERM) {
        warn!(?err, "Failed to terminate abandoned process group");
    }
    handle.mark_killed();
}
