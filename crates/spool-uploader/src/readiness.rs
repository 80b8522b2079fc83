// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cold-start gate: sweeps wait until a dependency reports it is alive.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ReadinessError;

#[async_trait]
pub trait ReadinessProbe {
    async fn is_ready(&self) -> bool;
}

/// Probe that is always ready, used when no readiness URL is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Probe issuing `GET <url>` and expecting `200 OK`.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpReadinessProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        HttpReadinessProbe {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!("READINESS | {} answered {}", self.url, response.status());
                false
            }
            Err(e) => {
                debug!("READINESS | {} unreachable: {e}", self.url);
                false
            }
        }
    }
}

/// Delay policy between readiness attempts. There is no attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for ReadinessBackoff {
    fn default() -> Self {
        ReadinessBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl ReadinessBackoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Polls `probe` until it reports ready and returns the number of attempts made.
///
/// Only cancellation ends the wait early.
pub async fn wait_until_ready(
    probe: &(dyn ReadinessProbe + Send + Sync),
    backoff: &ReadinessBackoff,
    cancel: &CancellationToken,
) -> Result<u32, ReadinessError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let ready = tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
            ready = probe.is_ready() => ready,
        };
        if ready {
            if attempts > 1 {
                info!("READINESS | Dependency ready after {attempts} attempts");
            }
            return Ok(attempts);
        }
        let delay = backoff.delay(attempts);
        debug!("READINESS | Not ready, retrying in {} ms", delay.as_millis());
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
