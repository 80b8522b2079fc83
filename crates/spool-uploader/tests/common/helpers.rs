// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use spool_uploader::bucket::bucket_name_for;
use spool_uploader::config::Config;
use spool_uploader::uploader::{AzureBlobUploader, BlobConnection, Credentials};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage account name used by the development storage emulator.
pub const ACCOUNT: &str = "devstoreaccount1";

/// Account key credentials for [`ACCOUNT`].
pub fn shared_key() -> Credentials {
    Credentials::SharedKey {
        account: ACCOUNT.to_string(),
        key: b"development storage key".to_vec(),
    }
}

/// Connection to the mock storage account served at `server_url`.
pub fn connection(server_url: &str, credentials: Credentials) -> BlobConnection {
    BlobConnection::new(
        Url::parse(server_url).expect("mock server URL"),
        credentials,
    )
}

/// Uploader talking to the mock storage account with `max_attempts` per request.
pub fn uploader(server_url: &str, max_attempts: u32) -> AzureBlobUploader {
    let client = spool_uploader::http_utils::build_client(None, Duration::from_secs(5))
        .expect("failed to build client");
    AzureBlobUploader::new(client, connection(server_url, shared_key()), max_attempts)
}

pub fn config(disk_path: &Path, server_url: &str) -> Config {
    Config::new(disk_path, connection(server_url, shared_key()))
}

/// Writes one message file into `root/bucket`.
pub fn write_message(root: &Path, bucket: &str, file: &str, content: &str) -> PathBuf {
    let dir = root.join(bucket);
    std::fs::create_dir_all(&dir).expect("failed to create bucket");
    let path = dir.join(file);
    std::fs::write(&path, content).expect("failed to write message");
    path
}

/// Name of the bucket `hours` hours before `now`.
pub fn bucket_hours_ago(now: DateTime<Utc>, hours: i64) -> String {
    bucket_name_for(now - ChronoDuration::hours(hours))
}

pub fn lines(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
