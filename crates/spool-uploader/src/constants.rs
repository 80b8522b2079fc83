// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Name of the claim marker file kept at the top of each spool root.
pub const CLAIM_MARKER_FILE_NAME: &str = "InProgress.txt";

/// `chrono` format of a time bucket directory name, e.g. `2024-03-01-17`.
pub const BUCKET_NAME_FORMAT: &str = "%Y-%m-%d-%H";

/// How often the scheduler starts a sweep cycle.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// A claim marker older than this is considered abandoned.
pub const CLAIM_STALENESS_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// The newest bucket is only drained once its timestamp is at least this old.
pub const BUCKET_COMPLETENESS_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Idle time required before the worker pool shrinks.
pub const IDLE_GRACE_PERIOD: Duration = Duration::from_secs(15 * 60);

/// A cycle draining more buckets than this counts as busy.
pub const BUSY_THRESHOLD: usize = 10;

pub const WORKERS_SCALE_UP_STEP: usize = 2;
pub const WORKERS_SCALE_DOWN_STEP: usize = 1;

pub const DEFAULT_WORKERS_MIN_COUNT: usize = 2;
pub const DEFAULT_WORKERS_MAX_COUNT: usize = 8;

/// Largest payload accepted by a single append block request (4 MiB).
pub const MAX_APPEND_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Storage REST API version sent with every request.
pub const STORAGE_API_VERSION: &str = "2021-08-06";
