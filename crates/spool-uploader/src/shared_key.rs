// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared Key authorization for blob service requests.
//!
//! The signature is an HMAC-SHA256, keyed with the decoded account key, over
//! the verb, the standard headers, every `x-ms-*` header and the resource path
//! with its query parameters.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LANGUAGE,
    CONTENT_LENGTH, CONTENT_TYPE, DATE, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    IF_UNMODIFIED_SINCE, RANGE,
};
use reqwest::Request;
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::error::UploadError;

type HmacSha256 = Hmac<Sha256>;

const DATE_HEADER: &str = "x-ms-date";
const MS_HEADER_PREFIX: &str = "x-ms-";
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Stamps `request` with `x-ms-date` and a Shared Key `Authorization` header.
pub fn authorize(
    request: &mut Request,
    account: &str,
    key: &[u8],
    now: DateTime<Utc>,
) -> Result<(), UploadError> {
    let date = now.format(HTTP_DATE_FORMAT).to_string();
    request
        .headers_mut()
        .insert(DATE_HEADER, header_value(&date)?);

    let signature = sign(key, &string_to_sign(request, account))?;
    request.headers_mut().insert(
        AUTHORIZATION,
        header_value(&format!("SharedKey {account}:{signature}"))?,
    );
    Ok(())
}

/// Base64 HMAC-SHA256 of `string_to_sign` under `key`.
pub fn sign(key: &[u8], string_to_sign: &str) -> Result<String, UploadError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| UploadError::Signature(e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// The canonical text a Shared Key signature covers.
pub fn string_to_sign(request: &Request, account: &str) -> String {
    let headers = request.headers();
    let mut text = format!("{}\n", request.method().as_str());

    let content_length = match content_length(request) {
        0 => String::new(),
        length => length.to_string(),
    };
    for value in [
        header_text(headers, &CONTENT_ENCODING),
        header_text(headers, &CONTENT_LANGUAGE),
        content_length,
        header_text(headers, &HeaderName::from_static("content-md5")),
        header_text(headers, &CONTENT_TYPE),
        header_text(headers, &DATE),
        header_text(headers, &IF_MODIFIED_SINCE),
        header_text(headers, &IF_MATCH),
        header_text(headers, &IF_NONE_MATCH),
        header_text(headers, &IF_UNMODIFIED_SINCE),
        header_text(headers, &RANGE),
    ] {
        text.push_str(&value);
        text.push('\n');
    }

    text.push_str(&canonicalized_headers(headers));
    text.push_str(&canonicalized_resource(request, account));
    text
}

fn canonicalized_headers(headers: &HeaderMap) -> String {
    let mut ms_headers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        if !name.as_str().starts_with(MS_HEADER_PREFIX) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            ms_headers.entry(name.as_str()).or_default().push(value.trim());
        }
    }
    ms_headers
        .into_iter()
        .map(|(name, values)| format!("{name}:{}\n", values.join(",")))
        .collect()
}

fn canonicalized_resource(request: &Request, account: &str) -> String {
    let url = request.url();
    let mut resource = format!("/{account}{}", url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push_str(&format!("\n{name}:{}", values.join(",")));
    }
    resource
}

fn content_length(request: &Request) -> u64 {
    if let Some(length) = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
    {
        return length;
    }
    request
        .body()
        .and_then(|body| body.as_bytes())
        .map_or(0, |bytes| bytes.len() as u64)
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn header_value(value: &str) -> Result<HeaderValue, UploadError> {
    HeaderValue::from_str(value).map_err(|e| UploadError::Signature(e.to_string()))
}
