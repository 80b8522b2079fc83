// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bucket;
pub mod config;
pub mod constants;
pub mod directory_processor;
pub mod error;
pub mod http_utils;
pub mod lease;
pub mod readiness;
pub mod scheduler;
pub mod shared_key;
pub mod uploader;
