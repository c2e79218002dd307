use crate::service::ServiceDescriptor;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Service table compiled into the binary, used when no config file is given.
pub const DEFAULT_CONFIG: &str = include_str!("default-config.yml");

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StagehandConfig {
    #[serde(default = "default_log")]
    pub log: String,
    /// Variables exported to preflight commands and every service.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Ports cleared before launching even though no service declares them.
    #[serde(default)]
    pub extra_reap_ports: Vec<u16>,
    #[serde(default)]
    pub launch: LaunchProperties,
    #[serde(default)]
    pub readiness: ReadinessProperties,
    #[serde(default)]
    pub shutdown: ShutdownProperties,
    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub monitor_interval: Duration,
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
    #[serde(default)]
    pub preflight: Vec<PreflightStep>,
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LaunchProperties {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How long a fresh process must survive to count as started.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ReadinessProperties {
    #[serde(with = "humantime_serde", default = "default_readiness_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ShutdownProperties {
    /// Grace period between SIGTERM and SIGKILL for each process group.
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub kill_timeout: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum PreflightStep {
    #[serde(rename_all = "kebab-case")]
    Command {
        command: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        working_directory: Option<PathBuf>,
        /// Skip the step when this path is missing.
        #[serde(default)]
        if_exists: Option<PathBuf>,
        /// Skip the step when this path is present.
        #[serde(default)]
        unless_exists: Option<PathBuf>,
        /// A failing optional step is reported but does not abort the run.
        #[serde(default)]
        optional: bool,
    },
    RemoveFile {
        path: PathBuf,
    },
    EnsureDir {
        path: PathBuf,
    },
    ExpectPath {
        path: PathBuf,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no services declared")]
    NoServices,
    #[error("service at position {0} has an empty name")]
    EmptyName(usize),
    #[error("service `{0}` is declared more than once")]
    DuplicateName(String),
    #[error("service `{0}` has an empty command")]
    EmptyCommand(String),
    #[error("port {port} is declared by both `{first}` and `{second}`")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("critical service `{0}` must declare a port")]
    CriticalWithoutPort(String),
    #[error("launch max-attempts must be at least 1")]
    NoAttempts,
    #[error("output-buffer-size must be at least 1")]
    EmptyOutputBuffer,
}

impl StagehandConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        if self.launch.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.output_buffer_size == 0 {
            return Err(ConfigError::EmptyOutputBuffer);
        }

        let mut names = HashSet::new();
        let mut ports: BTreeMap<u16, &str> = BTreeMap::new();
        for (index, service) in self.services.iter().enumerate() {
            if service.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(index));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateName(service.name.clone()));
            }
            if service.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(service.name.clone()));
            }
            match service.port {
                Some(port) => {
                    if let Some(first) = ports.insert(port, &service.name) {
                        return Err(ConfigError::DuplicatePort {
                            port,
                            first: first.to_string(),
                            second: service.name.clone(),
                        });
                    }
                }
                None if service.critical => {
                    return Err(ConfigError::CriticalWithoutPort(service.name.clone()))
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Every port to clear before launch, declared services first.
    pub fn reap_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.services.iter().filter_map(|s| s.port).collect();
        for port in &self.extra_reap_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

/// Reads the config file, or the built-in table when no path is given.
pub fn load(path: Option<&Path>) -> Result<StagehandConfig> {
    let config: StagehandConfig = match path {
        Some(path) => serde_yaml::from_reader(
            File::open(path)
                .wrap_err_with(|| format!("Failed to open {}", path.to_string_lossy()))?,
        )
        .wrap_err("Failed to read config!")?,
        None => serde_yaml::from_str(DEFAULT_CONFIG).wrap_err("Invalid built-in config")?,
    };
    config.validate().wrap_err("Invalid service table")?;
    Ok(config)
}

fn default_log() -> String {
    "info".into()
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_output_buffer_size() -> usize {
    2usize.pow(10) * 8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff() -> Duration {
    Duration::from_secs(3)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for LaunchProperties {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            settle: default_settle(),
            backoff: default_backoff(),
        }
    }
}

impl Default for ReadinessProperties {
    fn default() -> Self {
        Self {
            timeout: default_readiness_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for ShutdownProperties {
    fn default() -> Self {
        Self {
            kill_timeout: default_kill_timeout(),
        }
    }
}
