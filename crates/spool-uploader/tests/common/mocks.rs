// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! mockito stand-ins for the blob service endpoints

use mockito::{Matcher, Mock, ServerGuard};

const API_VERSION: &str = "2021-08-06";

/// `PUT /<container>?restype=container`
pub async fn create_container(
    server: &mut ServerGuard,
    container: &str,
    status: usize,
    hits: usize,
) -> Mock {
    server
        .mock("PUT", format!("/{container}").as_str())
        .match_query(Matcher::UrlEncoded("restype".into(), "container".into()))
        .match_header("x-ms-version", API_VERSION)
        .with_status(status)
        .expect(hits)
        .create_async()
        .await
}

/// `HEAD /<container>/<blob>` answering that the blob does not exist.
pub async fn missing_blob(
    server: &mut ServerGuard,
    container: &str,
    blob: &str,
    hits: usize,
) -> Mock {
    server
        .mock("HEAD", format!("/{container}/{blob}").as_str())
        .match_query(Matcher::Any)
        .with_status(404)
        .expect(hits)
        .create_async()
        .await
}

/// `HEAD /<container>/<blob>` answering with the length of an existing blob.
pub async fn existing_blob(
    server: &mut ServerGuard,
    container: &str,
    blob: &str,
    length: u64,
    hits: usize,
) -> Mock {
    server
        .mock("HEAD", format!("/{container}/{blob}").as_str())
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-length", length.to_string().as_str())
        .expect(hits)
        .create_async()
        .await
}

/// `PUT /<container>/<blob>` creating an empty append blob.
pub async fn create_blob(
    server: &mut ServerGuard,
    container: &str,
    blob: &str,
    status: usize,
) -> Mock {
    server
        .mock("PUT", format!("/{container}/{blob}").as_str())
        .match_query(Matcher::Any)
        .match_header("x-ms-blob-type", "AppendBlob")
        .match_header("x-ms-blob-content-type", "text/plain")
        .match_header("if-none-match", "*")
        .with_status(status)
        .expect(1)
        .create_async()
        .await
}

/// `PUT /<container>/<blob>?comp=appendblock` expecting `body` at `offset`.
pub async fn append_block(
    server: &mut ServerGuard,
    container: &str,
    blob: &str,
    offset: u64,
    body: &str,
    status: usize,
) -> Mock {
    server
        .mock("PUT", format!("/{container}/{blob}").as_str())
        .match_query(Matcher::UrlEncoded("comp".into(), "appendblock".into()))
        .match_header("x-ms-blob-type", Matcher::Missing)
        .match_header("x-ms-blob-condition-appendpos", offset.to_string().as_str())
        .match_body(body)
        .with_status(status)
        .expect(1)
        .create_async()
        .await
}
