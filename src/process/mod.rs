#[cfg(test)]
pub mod fake;
mod types;
pub mod unix;

pub use self::types::*;
use crate::service::ServiceDescriptor;
use nix::sys::signal::Signal;

/// Starts a service command as the leader of a new process group.
pub trait Spawner: Send + Sync {
    type Child: ChildProcess;

    fn spawn(&self, service: &ServiceDescriptor) -> Result<Self::Child, ProcessError>;
}

/// A spawned process group and its captured output.
pub trait ChildProcess: Send {
    fn pid(&self) -> u32;

    /// Returns the exit code once the leader has exited. Reaps the leader, so
    /// an exited child never lingers as a zombie.
    fn try_wait(&mut self) -> Result<Option<i32>, ProcessError>;

    /// Sends `signal` to the whole process group.
    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError>;

    /// Most recent combined stdout/stderr.
    fn output(&self) -> String;
}
