// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use std::path::PathBuf;

/// Errors raised while reading settings from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by a [`crate::uploader::BlobUploader`].
///
/// When one of these is returned the caller must assume that none of the
/// batch has been stored.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("record of {size} bytes exceeds the {limit} byte append block limit")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("{operation} request failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} request returned {status}: {body}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("append position conflict on {path}: expected length {expected}, found {found:?}")]
    AppendPosition {
        path: String,
        expected: u64,
        found: Option<u64>,
    },

    #[error("{path} has no readable content length")]
    MissingLength { path: String },

    #[error("Failed to sign request: {0}")]
    Signature(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl UploadError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UploadError::Request { .. } => true,
            UploadError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Errors that abort the drain of a single spool root.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't save {container} into {path}: {source}")]
    Upload {
        container: String,
        path: String,
        #[source]
        source: UploadError,
    },
}

impl DrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DrainError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Readiness wait cancelled")]
    Cancelled,
}
