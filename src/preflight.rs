use crate::configs::PreflightStep;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Runs every step in order. The first failing mandatory step aborts.
/// Cancellation stops the running command and skips the remaining steps
/// without an error.
pub async fn run_all(
    steps: &[PreflightStep],
    environment: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("Shutdown requested, skipping remaining preflight steps");
            return Ok(());
        }
        execute_step(step, environment, cancel)
            .instrument(info_span!("preflight", step = index + 1))
            .await
            .wrap_err_with(|| format!("Preflight step {} failed", index + 1))?;
    }
    Ok(())
}

async fn execute_step(
    step: &PreflightStep,
    environment: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    match step {
        PreflightStep::Command {
            command,
            description,
            working_directory,
            if_exists,
            unless_exists,
            optional,
        } => {
            let dir = working_directory.as_deref();
            if let Some(path) = if_exists {
                let path = resolve(dir, path);
                if !path.exists() {
                    warn!("{} not found, skipping...", path.to_string_lossy());
                    return Ok(());
                }
            }
            if let Some(path) = unless_exists {
                let path = resolve(dir, path);
                if path.exists() {
                    info!("{} already present, skipping...", path.to_string_lossy());
                    return Ok(());
                }
            }

            let label = description.as_deref().unwrap_or(command);
            match command_step(command, dir, environment, cancel).await {
                Ok(()) if cancel.is_cancelled() => {
                    info!("{label}: interrupted");
                    Ok(())
                }
                Ok(()) => {
                    info!("{label}: done");
                    Ok(())
                }
                Err(err) if *optional => {
                    warn!(?err, "{label}: failed, continuing");
                    Ok(())
                }
                Err(err) => Err(err.wrap_err(format!("{label}: failed"))),
            }
        }
        PreflightStep::RemoveFile { path } => match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("Removed {}", path.to_string_lossy());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).wrap_err_with(|| format!("Failed to remove {}", path.to_string_lossy()))
            }
        },
        PreflightStep::EnsureDir { path } => tokio::fs::create_dir_all(path)
            .await
            .wrap_err_with(|| format!("Failed to create {}", path.to_string_lossy())),
        PreflightStep::ExpectPath { path } => {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                Ok(())
            } else {
                Err(eyre!("{} not found", path.to_string_lossy()))
            }
        }
    }
}

async fn command_step(
    command: &str,
    dir: Option<&Path>,
    environment: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let argv = shell_words::split(command).wrap_err("Invalid command")?;
    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command");
    };

    info!("Running `{command}`...");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(environment)
        .stdin(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .spawn()
        .wrap_err_with(|| format!("Failed to run `{command}`"))?;

    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status.wrap_err_with(|| format!("Failed to wait for `{command}`"))?,
        _ = cancel.cancelled() => {
            if let Some(pid) = pid {
                if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(?err, "Failed to stop `{command}`");
                }
            }
            return Ok(());
        }
    };
    if !status.success() {
        bail!("`{command}` exited with {status}");
    }
    Ok(())
}

fn resolve(dir: Option<&Path>, path: &Path) -> PathBuf {
    match dir {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}
