use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(i32),
    Killed,
}

impl ProcessState {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process has no pid")]
    NoPid,

    #[error("no such process")]
    NoSuchProcess,

    #[error("signal error: `{0}`")]
    Signal(#[source] Errno),

    #[error("io error")]
    IOError(#[source] std::io::Error),
}

impl From<Errno> for ProcessError {
    fn from(value: Errno) -> Self {
        match value {
            Errno::ESRCH => ProcessError::NoSuchProcess,
            other => ProcessError::Signal(other),
        }
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(value: std::io::Error) -> Self {
        ProcessError::IOError(value)
    }
}
