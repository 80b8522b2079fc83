// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Appending batches of text records to append blobs.
//!
//! A batch is serialized as newline-terminated records and split into blocks
//! no larger than the append block limit, never splitting a record. Every
//! block is appended with an append-position condition, so a retried block
//! whose first attempt landed is recognised instead of being written twice.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode, Url};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::constants::{MAX_APPEND_BLOCK_SIZE, STORAGE_API_VERSION};
use crate::error::{ConfigError, UploadError};
use crate::http_utils::{build_client, retry_backoff};
use crate::shared_key;

const VERSION_HEADER: &str = "x-ms-version";
const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const BLOB_CONTENT_TYPE_HEADER: &str = "x-ms-blob-content-type";
const BLOB_CONTENT_ENCODING_HEADER: &str = "x-ms-blob-content-encoding";
const APPEND_POSITION_HEADER: &str = "x-ms-blob-condition-appendpos";

const CONTENT_TYPE: &str = "text/plain";
const CONTENT_ENCODING: &str = "utf-8";

const MIN_CONTAINER_NAME_LEN: usize = 3;
const MAX_CONTAINER_NAME_LEN: usize = 63;

#[async_trait]
pub trait BlobUploader {
    /// Appends `lines`, one newline-terminated record each, to the object at
    /// `path` in `container`, creating both when missing.
    ///
    /// Either the whole batch is durably appended or an error is returned.
    async fn append(&self, lines: &[String], container: &str, path: &str)
        -> Result<(), UploadError>;
}

/// Maps a spool root name onto a valid container name.
///
/// Container names are 3 to 63 lowercase letters, digits and single hyphens,
/// starting and ending with a letter or digit.
pub fn normalize_container_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (normalized.is_empty() || normalized.ends_with('-')) {
            continue;
        }
        normalized.push(c);
    }
    normalized.truncate(MAX_CONTAINER_NAME_LEN);
    while normalized.ends_with('-') {
        normalized.pop();
    }
    while normalized.len() < MIN_CONTAINER_NAME_LEN {
        normalized.push('0');
    }
    normalized
}

/// Maps a bucket name onto a blob name: lowercase, forward slashes, no leading slash.
pub fn normalize_blob_path(path: &str) -> String {
    path.to_lowercase()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// Serializes `lines` into blocks of at most `max_block_size` bytes.
pub fn chunk_lines(lines: &[String], max_block_size: usize) -> Result<Vec<Vec<u8>>, UploadError> {
    let mut blocks = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for line in lines {
        let record_size = line.len() + 1;
        if record_size > max_block_size {
            return Err(UploadError::RecordTooLarge {
                size: record_size,
                limit: max_block_size,
            });
        }
        if current.len() + record_size > max_block_size {
            blocks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(line.as_bytes());
        current.push(b'\n');
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    Ok(blocks)
}

/// Whether a block rejected on its append position was in fact already written
/// by an earlier attempt whose response got lost.
pub fn append_already_landed(offset: u64, block_len: usize, observed_len: Option<u64>) -> bool {
    observed_len == Some(offset + block_len as u64)
}

/// How requests to the blob service are authorized.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Query string appended to every request URL.
    SharedAccessSignature(String),
    /// Account name and decoded account key used to sign each request.
    SharedKey { account: String, key: Vec<u8> },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(..)"),
            Credentials::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
        }
    }
}

/// Blob service location and credentials parsed from a connection string.
///
/// Accepts `BlobEndpoint=<url>` or `DefaultEndpointsProtocol=<scheme>;AccountName=<name>;
/// EndpointSuffix=<suffix>`, with either `SharedAccessSignature=<sas>` or
/// `AccountName=<name>;AccountKey=<base64 key>`. A signature wins when both are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConnection {
    endpoint: Url,
    credentials: Credentials,
}

impl BlobConnection {
    pub fn new(endpoint: Url, credentials: Credentials) -> Self {
        let credentials = match credentials {
            Credentials::SharedAccessSignature(sas) => {
                Credentials::SharedAccessSignature(sas.trim_start_matches('?').to_string())
            }
            shared_key => shared_key,
        };
        BlobConnection {
            endpoint,
            credentials,
        }
    }

    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        let mut blob_endpoint = None;
        let mut protocol = "https".to_string();
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = "core.windows.net".to_string();
        let mut sas = None;

        for part in connection_string.split(';').filter(|part| !part.trim().is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(ConfigError::Invalid(format!(
                    "malformed connection string segment '{part}'"
                )));
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "blobendpoint" => blob_endpoint = Some(value),
                "defaultendpointsprotocol" => protocol = value,
                "accountname" => account_name = Some(value),
                "accountkey" => account_key = Some(value),
                "endpointsuffix" => endpoint_suffix = value,
                "sharedaccesssignature" => sas = Some(value),
                _ => {}
            }
        }

        let endpoint = match (blob_endpoint, &account_name) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("{protocol}://{account}.blob.{endpoint_suffix}"),
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "connection string needs a BlobEndpoint or an AccountName".into(),
                ))
            }
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ConfigError::Invalid(format!("invalid blob endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "blob endpoint '{endpoint}' is not a base URL"
            )));
        }

        let sas = sas
            .map(|sas| sas.trim_start_matches('?').to_string())
            .filter(|sas| !sas.is_empty());
        let credentials = match (sas, account_name, account_key) {
            (Some(sas), _, _) => Credentials::SharedAccessSignature(sas),
            (None, Some(account), Some(key)) => {
                let key = STANDARD.decode(key.as_bytes()).map_err(|e| {
                    ConfigError::Invalid(format!("AccountKey is not valid base64: {e}"))
                })?;
                if key.is_empty() {
                    return Err(ConfigError::Invalid("AccountKey is empty".into()));
                }
                Credentials::SharedKey { account, key }
            }
            (None, None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "AccountKey needs an AccountName to sign requests".into(),
                ))
            }
            (None, _, None) => {
                return Err(ConfigError::Invalid(
                    "connection string needs a SharedAccessSignature or an AccountKey".into(),
                ))
            }
        };
        Ok(BlobConnection::new(endpoint, credentials))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, segments: &[&str], params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        match &self.credentials {
            Credentials::SharedAccessSignature(sas) if !sas.is_empty() => url.set_query(Some(sas)),
            _ => url.set_query(None),
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }

    fn container_url(&self, container: &str) -> Url {
        self.url(&[container], &[("restype", "container")])
    }

    fn blob_url(&self, container: &str, path: &str) -> Url {
        self.url(&[container, path], &[])
    }

    fn append_block_url(&self, container: &str, path: &str) -> Url {
        self.url(&[container, path], &[("comp", "appendblock")])
    }
}

/// [`BlobUploader`] backed by the Azure Blob Storage REST API.
pub struct AzureBlobUploader {
    client: reqwest::Client,
    connection: BlobConnection,
    max_attempts: u32,
    max_block_size: usize,
    known_containers: Mutex<HashSet<String>>,
}

impl AzureBlobUploader {
    pub fn new(client: reqwest::Client, connection: BlobConnection, max_attempts: u32) -> Self {
        AzureBlobUploader {
            client,
            connection,
            max_attempts: max_attempts.max(1),
            max_block_size: MAX_APPEND_BLOCK_SIZE,
            known_containers: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, UploadError> {
        let client = build_client(
            config.https_proxy.as_deref(),
            Duration::from_secs(config.upload_timeout_secs),
        )?;
        Ok(AzureBlobUploader::new(
            client,
            config.blob_connection.clone(),
            config.upload_max_retries,
        ))
    }

    /// Overrides the append block limit.
    #[must_use]
    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size.max(1);
        self
    }

    async fn ensure_container(&self, container: &str) -> Result<(), UploadError> {
        if self.container_is_known(container) {
            return Ok(());
        }
        let url = self.connection.container_url(container);
        let response = self
            .send("create container", || self.request(Method::PUT, url.clone()))
            .await?;
        match response.status() {
            StatusCode::CREATED => debug!("UPLOAD | Created container {container}"),
            StatusCode::CONFLICT => {}
            _ => return Err(status_error("create container", response).await),
        }
        if let Ok(mut known) = self.known_containers.lock() {
            known.insert(container.to_string());
        }
        Ok(())
    }

    fn container_is_known(&self, container: &str) -> bool {
        self.known_containers
            .lock()
            .map(|known| known.contains(container))
            .unwrap_or(false)
    }

    fn forget_container(&self, container: &str) {
        if let Ok(mut known) = self.known_containers.lock() {
            known.remove(container);
        }
    }

    /// Current length of the blob, `None` when it does not exist.
    async fn blob_length(&self, container: &str, path: &str) -> Result<Option<u64>, UploadError> {
        let url = self.connection.blob_url(container, path);
        let response = self
            .send("get blob properties", || self.request(Method::HEAD, url.clone()))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => content_length(response.headers())
                .map(Some)
                .ok_or_else(|| UploadError::MissingLength {
                    path: format!("{container}/{path}"),
                }),
            _ => Err(status_error("get blob properties", response).await),
        }
    }

    /// Creates the append blob when missing and returns its current length.
    async fn ensure_blob(&self, container: &str, path: &str) -> Result<u64, UploadError> {
        if let Some(length) = self.blob_length(container, path).await? {
            return Ok(length);
        }
        let url = self.connection.blob_url(container, path);
        let response = self
            .send("create blob", || {
                self.request(Method::PUT, url.clone())
                    .header(BLOB_TYPE_HEADER, "AppendBlob")
                    .header(BLOB_CONTENT_TYPE_HEADER, CONTENT_TYPE)
                    .header(BLOB_CONTENT_ENCODING_HEADER, CONTENT_ENCODING)
                    .header(IF_NONE_MATCH, "*")
                    .header(CONTENT_LENGTH, 0)
            })
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                debug!("UPLOAD | Created blob {container}/{path}");
                Ok(0)
            }
            // another writer created it first
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => self
                .blob_length(container, path)
                .await?
                .ok_or_else(|| UploadError::AppendPosition {
                    path: format!("{container}/{path}"),
                    expected: 0,
                    found: None,
                }),
            _ => Err(status_error("create blob", response).await),
        }
    }

    async fn append_block(
        &self,
        container: &str,
        path: &str,
        offset: u64,
        block: &[u8],
    ) -> Result<(), UploadError> {
        let url = self.connection.append_block_url(container, path);
        let block_len = block.len();
        let response = self
            .send("append block", || {
                self.request(Method::PUT, url.clone())
                    .header(APPEND_POSITION_HEADER, offset)
                    .body(block.to_vec())
            })
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            StatusCode::PRECONDITION_FAILED => {
                let observed = self.blob_length(container, path).await?;
                if append_already_landed(offset, block_len, observed) {
                    debug!(
                        "UPLOAD | Block at offset {offset} of {container}/{path} was already appended"
                    );
                    Ok(())
                } else {
                    Err(UploadError::AppendPosition {
                        path: format!("{container}/{path}"),
                        expected: offset,
                        found: observed,
                    })
                }
            }
            _ => Err(status_error("append block", response).await),
        }
    }

    async fn append_blocks(
        &self,
        container: &str,
        path: &str,
        blocks: &[Vec<u8>],
    ) -> Result<(), UploadError> {
        self.ensure_container(container).await?;
        let mut offset = self.ensure_blob(container, path).await?;
        for block in blocks {
            self.append_block(container, path, offset, block).await?;
            offset += block.len() as u64;
        }
        Ok(())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(VERSION_HEADER, STORAGE_API_VERSION)
    }

    /// Sends the request built by `build`, retrying transport errors and
    /// transient statuses with exponential backoff.
    async fn send<F>(&self, operation: &'static str, build: F) -> Result<Response, UploadError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = self.authorize(operation, build())?;
            let e = match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    if !(status.is_server_error()
                        || status == StatusCode::REQUEST_TIMEOUT
                        || status == StatusCode::TOO_MANY_REQUESTS)
                    {
                        return Ok(response);
                    }
                    status_error(operation, response).await
                }
                Err(source) => UploadError::Request { operation, source },
            };

            if attempts >= self.max_attempts {
                error!("UPLOAD | {operation} failed after {attempts} attempts: {e}");
                return Err(e);
            }
            warn!("UPLOAD | {operation} failed (attempt {attempts}): {e}");
            tokio::time::sleep(retry_backoff(attempts)).await;
        }
    }

    /// Builds the request and signs it when the connection uses an account key.
    fn authorize(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Request, UploadError> {
        let mut request = builder
            .build()
            .map_err(|source| UploadError::Request { operation, source })?;
        if let Credentials::SharedKey { account, key } = &self.connection.credentials {
            shared_key::authorize(&mut request, account, key, Utc::now())?;
        }
        Ok(request)
    }
}

#[async_trait]
impl BlobUploader for AzureBlobUploader {
    async fn append(
        &self,
        lines: &[String],
        container: &str,
        path: &str,
    ) -> Result<(), UploadError> {
        let blocks = chunk_lines(lines, self.max_block_size)?;
        if blocks.is_empty() {
            debug!("UPLOAD | Nothing to append to {container}/{path}");
            return Ok(());
        }

        let container = normalize_container_name(container);
        let path = normalize_blob_path(path);

        let was_known = self.container_is_known(&container);
        match self.append_blocks(&container, &path, &blocks).await {
            Ok(()) => {}
            // the cached container was deleted behind our back
            Err(UploadError::Status { status, .. })
                if status == StatusCode::NOT_FOUND && was_known =>
            {
                warn!("UPLOAD | Container {container} disappeared, creating it again");
                self.forget_container(&container);
                self.append_blocks(&container, &path, &blocks).await?;
            }
            Err(e) => {
                if matches!(&e, UploadError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
                {
                    self.forget_container(&container);
                }
                return Err(e);
            }
        }
        debug!(
            "UPLOAD | Appended {} records in {} blocks to {container}/{path}",
            lines.len(),
            blocks.len()
        );
        Ok(())
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

async fn status_error(operation: &'static str, response: Response) -> UploadError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    UploadError::Status {
        operation,
        status,
        body,
    }
}
