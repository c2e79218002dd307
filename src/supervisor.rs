use crate::configs::{PreflightStep, StagehandConfig};
use crate::launcher::ServiceLauncher;
use crate::preflight;
use crate::process::Spawner;
use crate::readiness::{HealthProbe, ReadinessWaiter};
use crate::reaper::PortReaper;
use crate::service::{AggregateStatus, Registry};
use crate::signals::SignalCoordinator;
use color_eyre::Result;
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    ReapingPorts,
    Preflight,
    Launching(usize),
    Idle,
    ShuttingDown,
    Terminated,
}

pub struct Supervisor<S: Spawner, P, R> {
    registry: Registry<S::Child>,
    launcher: ServiceLauncher<S>,
    waiter: ReadinessWaiter<P>,
    reaper: R,
    reap_ports: Vec<u16>,
    preflight: Vec<PreflightStep>,
    environment: BTreeMap<String, String>,
    monitor_interval: Duration,
    kill_timeout: Duration,
    cancel: CancellationToken,
    state: SupervisorState,
}

impl<S: Spawner, P: HealthProbe, R: PortReaper> Supervisor<S, P, R> {
    pub fn new(
        config: &StagehandConfig,
        spawner: S,
        probe: P,
        reaper: R,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry: Registry::new(config.services.clone()),
            launcher: ServiceLauncher::new(spawner, &config.launch),
            waiter: ReadinessWaiter::new(
                probe,
                config.readiness.timeout,
                config.readiness.poll_interval,
            ),
            reaper,
            reap_ports: config.reap_ports(),
            preflight: config.preflight.clone(),
            environment: config.environment.clone(),
            monitor_interval: config.monitor_interval,
            kill_timeout: config.shutdown.kill_timeout,
            cancel,
            state: SupervisorState::Initializing,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn registry(&self) -> &Registry<S::Child> {
        &self.registry
    }

    /// Full lifecycle: start everything, idle until cancelled, tear down.
    pub async fn run(&mut self) -> Result<AggregateStatus> {
        let status = self.start().await?;
        self.idle().await;
        self.shutdown().await;
        Ok(status)
    }

    /// Reaps ports, runs preflight and launches every service in order.
    /// Only a preflight failure is an error.
    pub async fn start(&mut self) -> Result<AggregateStatus> {
        self.transition(SupervisorState::ReapingPorts);
        for port in &self.reap_ports {
            self.reaper.reap(*port).await;
        }

        self.transition(SupervisorState::Preflight);
        preflight::run_all(&self.preflight, &self.environment, &self.cancel).await?;

        self.launch_all().await;

        self.registry.refresh();
        let status = self.registry.status();
        status.log();
        Ok(status)
    }

    async fn launch_all(&mut self) {
        for index in 0..self.registry.len() {
            if self.cancel.is_cancelled() {
                warn!("Shutdown requested, not launching remaining services");
                return;
            }
            self.transition(SupervisorState::Launching(index));
            let Some(descriptor) = self.registry.descriptor(index).cloned() else {
                continue;
            };

            let Some(handle) = self.launcher.launch(&descriptor, &self.cancel).await else {
                error!(
                    "Service {} failed to start. Continuing with other services...",
                    descriptor.name
                );
                continue;
            };
            if let Err(rejected) = self.registry.register(index, handle) {
                error!(pid = rejected.pid, "{} is already running", descriptor.name);
                continue;
            }

            if let (true, Some(port)) = (descriptor.critical, descriptor.port) {
                if !self
                    .waiter
                    .wait_until_ready(&descriptor, port, &self.cancel)
                    .await
                {
                    warn!(
                        "Critical service {} is not ready, continuing with other services",
                        descriptor.name
                    );
                }
            }
        }
    }

    /// Watches for unexpected exits until the cancellation token fires.
    pub async fn idle(&mut self) {
        self.transition(SupervisorState::Idle);
        info!("All services started, press Ctrl+C to stop");

        let mut monitor = tokio::time::interval(self.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = monitor.tick() => {
                    for (service, exit_code) in self.registry.refresh() {
                        warn!(service, exit_code, "Service exited unexpectedly");
                    }
                }
            }
        }
    }

    /// SIGTERMs every process group, SIGKILLs the ones still alive after the
    /// grace period. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        self.transition(SupervisorState::ShuttingDown);
        info!("Stopping all services...");

        let targets: Vec<String> = self
            .registry
            .handles()
            .filter(|h| h.is_alive())
            .map(|h| h.service.clone())
            .collect();
        SignalCoordinator::cascade(&self.registry, Signal::SIGTERM);

        let deadline = Instant::now() + self.kill_timeout;
        loop {
            self.registry.refresh();
            if !self.registry.has_alive() {
                break;
            }
            if Instant::now() >= deadline {
                let killed = SignalCoordinator::cascade(&self.registry, Signal::SIGKILL);
                warn!("Kill timeout reached, sent SIGKILL to {killed} process groups");
                break;
            }
            sleep(SHUTDOWN_POLL).await;
        }

        for handle in self.registry.handles_mut() {
            if targets.contains(&handle.service) {
                handle.mark_killed();
            }
        }

        self.transition(SupervisorState::Terminated);
        info!("All services stopped");
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = ?self.state, to = ?next, "Supervisor state");
        self.state = next;
    }
}
