//! Application health checks after a restore.

use crate::{BackupError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn target(&self) -> String;

    /// One check; `Err` carries the reason the application is not healthy.
    async fn check(&self) -> Result<()>;
}

/// GETs a URL and expects a 2xx answer.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| BackupError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn check(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| BackupError::service_unavailable(&self.url, e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackupError::service_unavailable(
                &self.url,
                format!("HTTP {}", response.status()),
            ))
        }
    }
}

/// Poll `probe` until it succeeds, at most `attempts` times.
///
/// Returns the attempt number that succeeded.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    attempts: u32,
    interval: Duration,
) -> Result<u32> {
    let mut last_error = None;

    for attempt in 1..=attempts {
        match probe.check().await {
            Ok(()) => {
                info!(target = %probe.target(), attempt, "Application healthy");
                return Ok(attempt);
            }
            Err(e) => {
                debug!(target = %probe.target(), attempt, "Not healthy yet: {}", e);
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(BackupError::service_unavailable(
        probe.target(),
        format!(
            "not healthy after {} attempts: {}",
            attempts,
            last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string())
        ),
    ))
}
