use super::{ChildProcess, ProcessError, Spawner};
use crate::service::ServiceDescriptor;
use log_buffer::LogBuffer;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info_span, warn, Instrument};

type OutputCache = Arc<Mutex<LogBuffer<Vec<u8>>>>;

/// Runs service commands through `sh -c`, each in its own process group.
pub struct ShellSpawner {
    environment: BTreeMap<String, String>,
    buffer_size: usize,
}

impl ShellSpawner {
    pub fn new(environment: BTreeMap<String, String>, buffer_size: usize) -> Self {
        Self {
            environment,
            buffer_size: buffer_size.max(1),
        }
    }
}

pub struct UnixChild {
    child: Child,
    pid: u32,
    output: OutputCache,
}

impl Spawner for ShellSpawner {
    type Child = UnixChild;

    fn spawn(&self, service: &ServiceDescriptor) -> Result<UnixChild, ProcessError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&service.command)
            .current_dir(&service.working_directory)
            .envs(&self.environment)
            .envs(&service.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: service.command.clone(),
                source,
            })?;
        let pid = child.id().ok_or(ProcessError::NoPid)?;

        let output: OutputCache = Arc::new(Mutex::new(LogBuffer::new(vec![0; self.buffer_size])));
        let name = service.name.as_str();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(
                capture(stdout, output.clone())
                    .instrument(info_span!("read_stdout", service = name, pid)),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(
                capture(stderr, output.clone())
                    .instrument(info_span!("read_stderr", service = name, pid)),
            );
        }

        debug!(service = name, pid, "Spawned process group");
        Ok(UnixChild { child, pid, output })
    }
}

impl ChildProcess for UnixChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<i32>, ProcessError> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        killpg(Pid::from_raw(self.pid as i32), signal)?;
        Ok(())
    }

    fn output(&self) -> String {
        self.output.lock().extract().to_string()
    }
}

/// Shell convention: a process killed by a signal reports `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or_default())
}

async fn capture<R: AsyncRead + Unpin>(reader: R, output: OutputCache) {
    let mut reader = BufReader::new(reader).split(b'\n');
    loop {
        match reader.next_segment().await {
            Ok(Some(segment)) => {
                let line = String::from_utf8_lossy(&segment);
                debug!("{line}");
                let mut cache = output.lock();
                if let Err(err) = writeln!(cache, "{line}") {
                    error!(?err, "Cache error");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(?err, "Reading output failed");
                break;
            }
        }
    }
    debug!("Output closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn service(command: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "test".into(),
            command: command.into(),
            working_directory: PathBuf::from("."),
            port: None,
            health_path: "/health".into(),
            critical: false,
            env: BTreeMap::new(),
        }
    }

    async fn wait_exit(child: &mut UnixChild) -> i32 {
        let start = Instant::now();
        loop {
            if let Some(code) = child.try_wait().unwrap() {
                return code;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "child never exited");
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_output(child: &UnixChild, expected: &str) -> String {
        let start = Instant::now();
        loop {
            let output = child.output();
            if output.contains(expected) || start.elapsed() > Duration::from_secs(5) {
                return output;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let spawner = ShellSpawner::new(BTreeMap::new(), 1024);
        let mut child = spawner
            .spawn(&service("echo out; echo err >&2; exit 3"))
            .unwrap();

        assert_eq!(wait_exit(&mut child).await, 3);
        let output = wait_output(&child, "err").await;
        assert!(output.contains("out"), "{output:?}");
        assert!(output.contains("err"), "{output:?}");
    }

    #[tokio::test]
    async fn leads_its_own_process_group() {
        let spawner = ShellSpawner::new(BTreeMap::new(), 1024);
        let mut child = spawner.spawn(&service("sleep 30")).unwrap();
        let pid = Pid::from_raw(child.pid() as i32);

        assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
        assert_ne!(nix::unistd::getpgid(None).unwrap(), pid);
        assert!(child.try_wait().unwrap().is_none());

        child.signal_group(Signal::SIGTERM).unwrap();
        assert_eq!(wait_exit(&mut child).await, 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn signalling_a_gone_group_reports_no_such_process() {
        let spawner = ShellSpawner::new(BTreeMap::new(), 1024);
        let mut child = spawner.spawn(&service("exit 0")).unwrap();
        wait_exit(&mut child).await;

        assert!(matches!(
            child.signal_group(Signal::SIGTERM),
            Err(ProcessError::NoSuchProcess)
        ));
    }

    #[tokio::test]
    async fn applies_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let environment = BTreeMap::from([("GREETING".to_string(), "global".to_string())]);
        let spawner = ShellSpawner::new(environment, 1024);
        let mut descriptor = service("echo \"$GREETING $TARGET $(pwd)\"");
        descriptor.working_directory = dir.path().to_path_buf();
        descriptor
            .env
            .insert("TARGET".to_string(), "local".to_string());

        let mut child = spawner.spawn(&descriptor).unwrap();
        assert_eq!(wait_exit(&mut child).await, 0);

        let canonical = dir.path().canonicalize().unwrap();
        let expected = format!("global local {}", canonical.to_string_lossy());
        let output = wait_output(&child, &expected).await;
        assert!(output.contains(&expected), "{output:?}");
    }

    #[tokio::test]
    async fn missing_working_directory_fails_to_spawn() {
        let spawner = ShellSpawner::new(BTreeMap::new(), 1024);
        let mut descriptor = service("true");
        descriptor.working_directory = PathBuf::from("/definitely/not/here");

        assert!(matches!(
            spawner.spawn(&descriptor),
            Err(ProcessError::Spawn { .. })
        ));
    }
}
