use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("health request failed")]
    Request(#[from] reqwest::Error),

    #[error("unhealthy status code `{0}`")]
    Unhealthy(u16),

    #[error("health request timed out")]
    Timeout,
}

/// A single health request. Only the status code decides readiness.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), ProbeError>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> color_eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), ProbeError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy(status.as_u16()))
        }
    }
}

pub fn health_url(port: u16, path: &str) -> String {
    format!("http://localhost:{port}/{}", path.trim_start_matches('/'))
}

pub struct ReadinessWaiter<P> {
    probe: P,
    timeout: Duration,
    poll_interval: Duration,
}

impl<P: HealthProbe> ReadinessWaiter<P> {
    pub fn new(probe: P, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            probe,
            timeout,
            poll_interval,
        }
    }

    /// Polls the service's health endpoint until it answers 2xx or the
    /// timeout elapses. Errors while polling only mean "not ready yet".
    #[instrument(skip_all, fields(service = %service.name, port = port))]
    pub async fn wait_until_ready(
        &self,
        service: &ServiceDescriptor,
        port: u16,
        cancel: &CancellationToken,
    ) -> bool {
        let url = health_url(port, &service.health_path);
        info!(
            "Waiting for {} to be available on port {port}...",
            service.name
        );

        let deadline = Instant::now() + self.timeout;
        loop {
            let started = Instant::now();
            if started >= deadline {
                break;
            }

            let budget = self.poll_interval.min(deadline - started);
            let result = match timeout(budget, self.probe.probe(&url, budget)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            };
            match result {
                Ok(()) => {
                    info!("{} is ready on port {port}", service.name);
                    return true;
                }
                Err(err) => debug!(%err, "Not ready yet"),
            }

            tokio::select! {
                _ = sleep_until((started + self.poll_interval).min(deadline)) => {}
                _ = cancel.cancelled() => {
                    info!("Stopped waiting for {}", service.name);
                    return false;
                }
            }
        }

        warn!(
            "{} did not become available on port {port} within {}",
            service.name,
            humantime::format_duration(self.timeout)
        );
        false
    }
}
