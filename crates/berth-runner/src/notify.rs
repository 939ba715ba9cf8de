//! Deploy notifier: one JSON POST after a readiness grace period.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::NotifyError;

/// Default request timeout for the notification POST.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of the deploy notification.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct NotifyPayload {
    pub item: String,
    pub repo: String,
    pub token: String,
    pub version: String,
}

impl std::fmt::Debug for NotifyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyPayload")
            .field("item", &self.item)
            .field("repo", &self.repo)
            .field("token", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}

/// Whether the notification went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    http_client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Result<Self, NotifyError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, NotifyError> {
        let http_client = reqwest::Client::builder()
            .user_agent(format!("berth/{}", berth_core::VERSION))
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self { http_client })
    }

    /// Skip entirely when `enabled` is false: no wait, no request, and
    /// `payload` is never built. Otherwise sleep `readiness_delay`, then POST once.
    pub async fn wait_then_notify<F>(
        &self,
        readiness_delay: Duration,
        enabled: bool,
        payload: F,
        endpoint: &str,
    ) -> Result<NotifyOutcome, NotifyError>
    where
        F: FnOnce() -> Result<NotifyPayload, NotifyError>,
    {
        if !enabled {
            debug!(endpoint = %endpoint, "notify disabled");
            return Ok(NotifyOutcome::Disabled);
        }
        check_endpoint(endpoint)?;
        let payload = payload()?;

        if !readiness_delay.is_zero() {
            debug!(delay_secs = readiness_delay.as_secs(), "waiting before notify");
            tokio::time::sleep(readiness_delay).await;
        }
        self.post(endpoint, &payload).await?;
        Ok(NotifyOutcome::Sent)
    }

    /// A single POST; non-2xx and transport errors are returned, never retried.
    pub async fn post(&self, endpoint: &str, payload: &NotifyPayload) -> Result<(), NotifyError> {
        check_endpoint(endpoint)?;
        let response = self
            .http_client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|source| NotifyError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        info!(
            endpoint = %endpoint,
            item = %payload.item,
            status = status.as_u16(),
            "deploy notified"
        );
        Ok(())
    }
}

fn check_endpoint(endpoint: &str) -> Result<(), NotifyError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|_| NotifyError::InvalidEndpoint(endpoint.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(NotifyError::InvalidEndpoint(endpoint.to_string())),
    }
}
