use crate::process::{ChildProcess, ProcessError, ProcessState};
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceDescriptor {
    pub name: String,
    /// Passed to `sh -c`.
    pub command: String,
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    /// Only probed when the service is critical.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// The supervisor waits for a critical service to become ready before
    /// launching the next one.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_health_path() -> String {
    "/health".into()
}

pub struct ProcessHandle<C> {
    pub service: String,
    pub pid: u32,
    /// Equal to `pid`, every service leads its own group.
    pub pgid: u32,
    pub state: ProcessState,
    pub started_at: DateTime<Local>,
    child: C,
}

impl<C: ChildProcess> ProcessHandle<C> {
    pub fn new(service: impl Into<String>, child: C) -> Self {
        let pid = child.pid();
        Self {
            service: service.into(),
            pid,
            pgid: pid,
            state: ProcessState::Starting,
            started_at: Local::now(),
            child,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Checks whether the leader has exited, returning the code on the
    /// transition only.
    pub fn poll_exit(&mut self) -> Option<i32> {
        if !self.is_alive() {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(code)) => {
                self.state = ProcessState::Exited(code);
                Some(code)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(?err, service = %self.service, "Failed to check process state");
                None
            }
        }
    }

    pub fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        self.child.signal_group(signal)
    }

    /// Final state for a handle torn down by us rather than by itself.
    pub fn mark_killed(&mut self) {
        self.poll_exit();
        self.state = ProcessState::Killed;
    }

    pub fn output(&self) -> String {
        self.child.output()
    }
}

impl<C> fmt::Debug for ProcessHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("service", &self.service)
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish()
    }
}

pub struct RegistryEntry<C> {
    pub descriptor: ServiceDescriptor,
    pub handle: Option<ProcessHandle<C>>,
}

/// Declared services in launch order, each with its handle once launched.
pub struct Registry<C> {
    entries: Vec<RegistryEntry<C>>,
}

impl<C: ChildProcess> Registry<C> {
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Self {
        Self {
            entries: descriptors
                .into_iter()
                .map(|descriptor| RegistryEntry {
                    descriptor,
                    handle: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn descriptor(&self, index: usize) -> Option<&ServiceDescriptor> {
        self.entries.get(index).map(|e| &e.descriptor)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<C>> {
        self.entries.iter()
    }

    pub fn handle(&self, name: &str) -> Option<&ProcessHandle<C>> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .and_then(|e| e.handle.as_ref())
    }

    /// Stores the handle for the descriptor at `index`. A slot already holding
    /// a live handle is left untouched and the new handle is handed back.
    pub fn register(
        &mut self,
        index: usize,
        handle: ProcessHandle<C>,
    ) -> Result<(), ProcessHandle<C>> {
        match self.entries.get_mut(index) {
            Some(entry) if !entry.handle.as_ref().is_some_and(|h| h.is_alive()) => {
                entry.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle<C>> {
        self.entries.iter().filter_map(|e| e.handle.as_ref())
    }

    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut ProcessHandle<C>> {
        self.entries.iter_mut().filter_map(|e| e.handle.as_mut())
    }

    pub fn has_alive(&self) -> bool {
        self.handles().any(|h| h.is_alive())
    }

    /// Picks up exits that happened since the last check.
    pub fn refresh(&mut self) -> Vec<(String, i32)> {
        self.handles_mut()
            .filter_map(|h| h.poll_exit().map(|code| (h.service.clone(), code)))
            .collect()
    }

    pub fn status(&self) -> AggregateStatus {
        AggregateStatus {
            services: self
                .entries
                .iter()
                .map(|e| ServiceStatus {
                    name: e.descriptor.name.clone(),
                    port: e.descriptor.port,
                    running: e.handle.as_ref().is_some_and(|h| h.is_alive()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub port: Option<u16>,
    pub running: bool,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mark, state) = if self.running {
            ('✓', "running")
        } else {
            ('✗', "not running")
        };
        write!(f, "{mark} {} - {state}", self.name)?;
        if let Some(port) = self.port {
            write!(f, " (port {port})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStatus {
    pub services: Vec<ServiceStatus>,
}

impl AggregateStatus {
    pub fn is_running(&self, name: &str) -> Option<bool> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.running)
    }

    pub fn running_count(&self) -> usize {
        self.services.iter().filter(|s| s.running).count()
    }

    pub fn log(&self) {
        info!(
            "Services status: {}/{} running",
            self.running_count(),
            self.services.len()
        );
        for service in &self.services {
            info!("  {service}");
        }
    }
}
