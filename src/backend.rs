//! Status and model-management endpoints of the inference backend.
//!
//! The chat stream itself lives in [`crate::session`]; this module covers the
//! simpler request/response calls around it: `/health`, readiness polling,
//! `/v1/profiles` and `/v1/models/switch`.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, StudioError};
use crate::wire::{self, HealthResponse, SwitchRequest, SwitchResponse};

/// Overall verdict of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// 2xx with `status == "healthy"`.
    Healthy,
    /// Reachable, but the model is not ready (typically 503 `loading`).
    Loading,
    /// Connection failed or the reply was not understood.
    Unreachable,
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "HEALTHY"),
            HealthVerdict::Loading => write!(f, "LOADING"),
            HealthVerdict::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Result of one `/health` probe.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    pub response_time: Duration,
    pub health: Option<HealthResponse>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.verdict == HealthVerdict::Healthy
    }
}

/// Timeouts for the status endpoints. The chat stream has none of its own.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl BackendConfig {
    /// Defaults: connect 3 s, request 10 s.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct BackendClient {
    config: BackendConfig,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(BackendConfig::new(base_url))
    }

    pub fn with_config(config: BackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Fetch and parse `/health`.
    ///
    /// A 503 whose body still parses is returned as `Ok`: the backend uses it
    /// to report `loading`. Other non-2xx replies are errors.
    pub async fn fetch_health(&self) -> Result<HealthResponse> {
        let resp = self.client.get(self.url("/health")).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        let parsed = serde_json::from_str::<HealthResponse>(&body);
        if status.is_success() {
            return Ok(parsed?);
        }
        match parsed {
            Ok(health) if status == StatusCode::SERVICE_UNAVAILABLE => Ok(health),
            _ => Err(StudioError::Backend(format!(
                "HTTP {} from /health: {}",
                status.as_u16(),
                wire::error_message(&body, status.canonical_reason().unwrap_or("error"))
            ))),
        }
    }

    /// Probe once, folding every failure into the report.
    pub async fn check(&self) -> HealthReport {
        let started = Instant::now();
        let result = self.fetch_health().await;
        let response_time = started.elapsed();

        match result {
            Ok(health) => {
                let verdict = if health.is_healthy() {
                    HealthVerdict::Healthy
                } else {
                    HealthVerdict::Loading
                };
                HealthReport { verdict, response_time, health: Some(health), error: None }
            }
            Err(e) => {
                debug!(error = %e, url = %self.config.base_url, "health probe failed");
                HealthReport {
                    verdict: HealthVerdict::Unreachable,
                    response_time,
                    health: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Poll `/health` every `interval` until ready or `max_wait` elapses.
    pub async fn wait_for_ready(&self, max_wait: Duration, interval: Duration) -> Result<HealthReport> {
        info!(url = %self.config.base_url, ?max_wait, "waiting for backend to become ready");
        let deadline = Instant::now() + max_wait;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts: u32 = 0;

        loop {
            ticker.tick().await;
            attempts = attempts.saturating_add(1);
            let report = self.check().await;
            if report.is_ready() {
                info!(attempts, "backend ready");
                return Ok(report);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, ?max_wait, "backend not ready before deadline");
                return Err(StudioError::NotReady(max_wait));
            }
            info!(
                attempt = attempts,
                verdict = %report.verdict,
                remaining_secs = deadline.saturating_duration_since(now).as_secs(),
                "backend not ready yet"
            );
        }
    }

    /// `GET /v1/profiles`, passed through untouched.
    pub async fn profiles(&self) -> Result<Value> {
        let resp = self.client.get(self.url("/v1/profiles")).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(StudioError::Backend(format!(
                "HTTP {} from /v1/profiles: {}",
                status.as_u16(),
                wire::error_message(&body, "could not list profiles")
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Ask the backend to load another model profile. Returns the active profile.
    pub async fn switch_model(&self, profile: &str) -> Result<String> {
        info!(profile, "requesting model switch");
        let resp = self
            .client
            .post(self.url("/v1/models/switch"))
            .json(&SwitchRequest { profile: profile.to_string() })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;

        match serde_json::from_str::<SwitchResponse>(&body) {
            Ok(r) if status.is_success() && r.status == "success" => {
                Ok(r.active_profile.unwrap_or_else(|| profile.to_string()))
            }
            Ok(r) => Err(StudioError::Backend(
                r.message.unwrap_or_else(|| format!("model switch failed with HTTP {}", status.as_u16())),
            )),
            Err(_) => Err(StudioError::Backend(format!(
                "model switch failed with HTTP {}: {}",
                status.as_u16(),
                wire::error_message(&body, "no body")
            ))),
        }
    }
}
