//! Partner bridge status polling.

use crate::error::Result;
use crate::event::Event;
use crate::types::BridgeStatus;
use chrono::Utc;
use reqwest::header::{ACCEPT, HeaderValue};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Path of the status endpoint served by every bridge
pub const STATUS_PATH: &str = "/status";

/// Polls the partner's status endpoint
pub struct PartnerPoller {
    client: reqwest::Client,
    url: String,
    sequence: AtomicU64,
}

impl PartnerPoller {
    /// Create a poller for the partner at `partner_url`
    ///
    /// # Arguments
    /// * `partner_url` - Base URL of the partner bridge (e.g., "http://10.0.0.2:8080")
    /// * `timeout` - Upper bound of a whole poll
    /// * `local_ip` - Source address of the polls, if pinned to an interface
    pub fn new(partner_url: &str, timeout: Duration, local_ip: Option<IpAddr>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(timeout * 4)
            .pool_max_idle_per_host(2)
            .local_address(local_ip)
            .build()
            .map_err(|e| common::Error::partner(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}{}", partner_url.trim_end_matches('/'), STATUS_PATH),
            sequence: AtomicU64::new(0),
        })
    }

    /// Full URL polled
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Poll the partner once; every outcome is an event
    pub async fn poll(&self) -> Event {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        match self.fetch().await {
            Ok(status) => Event::PartnerPollSuccess {
                timestamp: Utc::now(),
                sequence,
                status: Box::new(status),
            },
            Err(e) => {
                debug!(url = %self.url, sequence, error = %e, "Failed to query partner status");
                Event::PartnerPollFailure {
                    timestamp: Utc::now(),
                    sequence,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn fetch(&self) -> common::Result<BridgeStatus> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(common::Error::partner)?;

        let body = response
            .bytes()
            .await
            .map_err(|e| common::Error::partner(format!("failed to read status: {}", e)))?;

        serde_json::from_slice(&body)
            .map_err(|e| common::Error::partner(format!("failed to parse status: {}", e)))
    }
}
