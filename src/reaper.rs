use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Frees a port by killing whatever is bound to it. Never fails: anything it
/// cannot clear surfaces later as a bind failure of the launched service.
#[async_trait]
pub trait PortReaper: Send + Sync {
    async fn reap(&self, port: u16);
}

/// Looks up the listeners on a TCP port with lsof and SIGKILLs them.
/// Clients connected to the port are left alone.
pub struct LsofReaper;

#[async_trait]
impl PortReaper for LsofReaper {
    #[instrument(skip(self))]
    async fn reap(&self, port: u16) {
        let pids = match find_pids(port).await {
            Ok(pids) => pids,
            Err(err) => {
                warn!(?err, "Error looking up processes on port {port}");
                return;
            }
        };
        if pids.is_empty() {
            debug!("Port {port} is free");
            return;
        }

        let own_pid = std::process::id() as i32;
        for pid in pids {
            if pid == own_pid {
                warn!("Port {port} is held by the supervisor itself, skipping");
                continue;
            }
            info!("Killing process {pid} on port {port}");
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(?err, pid, "Failed to kill process on port {port}");
            }
        }
    }
}

async fn find_pids(port: u16) -> Result<Vec<i32>> {
    // lsof exits non-zero when nothing matches, so only stdout matters.
    let output = Command::new("lsof")
        .args(lsof_args(port))
        .output()
        .await
        .wrap_err("Failed to run lsof")?;
    Ok(parse_pids(&String::from_utf8_lossy(&output.stdout)))
}

fn lsof_args(port: u16) -> [String; 4] {
    [
        "-t".into(),
        "-nP".into(),
        format!("-iTCP:{port}"),
        "-sTCP:LISTEN".into(),
    ]
}

fn parse_pids(output: &str) -> Vec<i32> {
    let mut pids = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.parse::<i32>() {
            Ok(pid) if pid > 0 => {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
            _ => warn!("Ignoring unexpected lsof output {line:?}"),
        }
    }
    pids
}
