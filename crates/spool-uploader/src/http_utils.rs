// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

use crate::error::UploadError;

/// Base delay of the exponential backoff applied between storage request attempts.
const RETRY_BACKOFF_BASE_MS: u64 = 100;

/// Builds a reqwest client with optional proxy configuration and timeout.
/// Uses rustls TLS.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, UploadError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout);
    if let Some(proxy) = proxy_url {
        let proxy = reqwest::Proxy::https(proxy).map_err(|e| UploadError::Client(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| UploadError::Client(e.to_string()))
}

/// Delay to wait after the given failed attempt (1-based) before trying again.
pub fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(RETRY_BACKOFF_BASE_MS * 2_u64.pow(exponent))
}
