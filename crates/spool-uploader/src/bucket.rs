// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the spool.
//!
//! ```text
//! <disk path>/
//!   <spool root>/            one per stream, named after the destination container
//!     InProgress.txt         claim marker, see crate::lease
//!     2024-03-01-16/         time bucket, one per hour
//!       <message file>       one message, one or more lines
//!     2024-03-01-17/
//! ```
//!
//! Bucket names sort chronologically, so the lexicographically last bucket is
//! the one producers may still be writing to.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::BUCKET_NAME_FORMAT;

/// Length of a well formed bucket name, `YYYY-MM-DD-HH`.
const BUCKET_NAME_LEN: usize = 13;

/// A directory holding the time buckets of one logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolRoot {
    path: PathBuf,
    name: String,
}

impl SpoolRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = file_name(&path);
        SpoolRoot { path, name }
    }

    /// Lists every spool root directly under `disk_path`, sorted by name.
    pub async fn discover(disk_path: &Path) -> io::Result<Vec<SpoolRoot>> {
        let mut roots: Vec<SpoolRoot> = list_subdirectories(disk_path)
            .await?
            .into_iter()
            .map(SpoolRoot::new)
            .collect();
        roots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roots)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory name of the root, which is also the destination container.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time buckets of this root in ascending (chronological) order.
    pub async fn buckets(&self) -> io::Result<Vec<TimeBucket>> {
        let mut buckets: Vec<TimeBucket> = list_subdirectories(&self.path)
            .await?
            .into_iter()
            .map(TimeBucket::new)
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }
}

/// An hour-truncated subdirectory of a spool root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucket {
    path: PathBuf,
    name: String,
}

impl TimeBucket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = file_name(&path);
        TimeBucket { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory name of the bucket, which is also the destination object path.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_bucket_name(&self.name)
    }

    /// Message files of the bucket. Order is whatever the filesystem returns.
    pub async fn message_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// Parses a `YYYY-MM-DD-HH` bucket name as a UTC instant.
pub fn parse_bucket_name(name: &str) -> Option<DateTime<Utc>> {
    if name.len() != BUCKET_NAME_LEN {
        return None;
    }
    // chrono needs minutes to build a time of day
    let format = format!("{BUCKET_NAME_FORMAT}:%M");
    NaiveDateTime::parse_from_str(&format!("{name}:00"), &format)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Formats the bucket name that `instant` falls into.
pub fn bucket_name_for(instant: DateTime<Utc>) -> String {
    instant.format(BUCKET_NAME_FORMAT).to_string()
}

/// Number of leading buckets (of a name-sorted slice) that are safe to drain.
///
/// Every bucket but the last is complete. The last one is only drained when
/// its name is a bucket timestamp at least `completeness_age` old, and never
/// when it is the only bucket of the root.
pub fn drainable_count(
    buckets: &[TimeBucket],
    now: DateTime<Utc>,
    completeness_age: Duration,
) -> usize {
    let Some(last) = buckets.last() else {
        return 0;
    };
    if buckets.len() == 1 {
        return 0;
    }
    let last_is_complete = last.timestamp().is_some_and(|created| {
        now.signed_duration_since(created)
            .to_std()
            .is_ok_and(|age| age >= completeness_age)
    });
    if last_is_complete {
        buckets.len()
    } else {
        buckets.len() - 1
    }
}

async fn list_subdirectories(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
