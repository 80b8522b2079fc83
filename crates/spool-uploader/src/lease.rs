// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Claim marker of a spool root, modelled as a lease with a time to live.
//!
//! The marker is created with create-if-absent semantics so two sweeps racing
//! on the same root cannot both acquire it. A sweep that dies leaves the
//! marker behind; once it is older than the time to live the next sweep
//! supersedes it. The expired marker is first renamed to a private tombstone
//! and checked again there, so a sweep that read it as expired never deletes a
//! marker another sweep has just created.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::constants::CLAIM_MARKER_FILE_NAME;

static TOMBSTONE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Result of trying to claim a spool root.
#[derive(Debug)]
pub enum ClaimOutcome {
    Acquired(ClaimLease),
    /// Another sweep holds a lease that has not expired yet.
    Held { acquired_at: DateTime<Utc> },
}

/// A claim on a spool root held by the current sweep.
#[derive(Debug)]
pub struct ClaimLease {
    marker_path: PathBuf,
    acquired_at: DateTime<Utc>,
    superseded: Option<DateTime<Utc>>,
}

impl ClaimLease {
    pub fn marker_path(root: &Path) -> PathBuf {
        root.join(CLAIM_MARKER_FILE_NAME)
    }

    /// Claims `root` unless a marker younger than `ttl` already exists.
    pub async fn acquire(root: &Path, ttl: Duration, now: DateTime<Utc>) -> io::Result<ClaimOutcome> {
        let marker_path = Self::marker_path(root);
        let mut superseded = None;

        // a second pass covers a marker removed or expired between our checks
        for _ in 0..2 {
            match create_marker(&marker_path, now).await {
                Ok(()) => {
                    return Ok(ClaimOutcome::Acquired(ClaimLease {
                        marker_path,
                        acquired_at: now,
                        superseded,
                    }))
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let Some(acquired_at) = read_marker(&marker_path).await? else {
                continue;
            };
            if !is_expired(acquired_at, now, ttl) {
                return Ok(ClaimOutcome::Held { acquired_at });
            }
            match take_over(&marker_path, acquired_at).await? {
                Takeover::Removed => superseded = Some(acquired_at),
                Takeover::Gone => {}
                Takeover::Replaced(acquired_at) => return Ok(ClaimOutcome::Held { acquired_at }),
            }
        }

        match read_marker(&marker_path).await? {
            Some(acquired_at) => Ok(ClaimOutcome::Held { acquired_at }),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("claim marker {} kept changing", marker_path.display()),
            )),
        }
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When this lease replaced an expired one, the acquisition time of the latter.
    pub fn superseded(&self) -> Option<DateTime<Utc>> {
        self.superseded
    }

    pub fn path(&self) -> &Path {
        &self.marker_path
    }

    /// Deletes the marker. A marker already gone counts as released.
    pub async fn release(self) -> io::Result<()> {
        remove_if_present(&self.marker_path).await
    }
}

/// Whether a lease acquired at `acquired_at` is abandoned at `now`.
pub fn is_expired(acquired_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now.signed_duration_since(acquired_at)
        .to_std()
        .is_ok_and(|age| age >= ttl)
}

/// Reads the acquisition time of an existing marker, `None` when there is no marker.
///
/// The marker body holds an RFC 3339 timestamp. Markers with any other body
/// are dated by their filesystem creation time, or modification time where
/// the platform does not record creation.
pub async fn read_marker(marker_path: &Path) -> io::Result<Option<DateTime<Utc>>> {
    let body = match tokio::fs::read_to_string(marker_path).await {
        Ok(body) => Some(body),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => None,
        Err(e) => return Err(e),
    };
    if let Some(acquired_at) = body
        .as_deref()
        .and_then(|body| DateTime::parse_from_rfc3339(body.trim()).ok())
    {
        return Ok(Some(acquired_at.with_timezone(&Utc)));
    }

    let metadata = match tokio::fs::metadata(marker_path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let created = metadata.created().or_else(|_| metadata.modified())?;
    Ok(Some(DateTime::<Utc>::from(created)))
}

enum Takeover {
    /// The expired marker was removed.
    Removed,
    /// Someone else moved the marker first.
    Gone,
    /// The marker had been replaced by a live one, which was put back.
    Replaced(DateTime<Utc>),
}

/// Removes the marker at `marker_path` if it is still the one acquired at `expired_at`.
async fn take_over(marker_path: &Path, expired_at: DateTime<Utc>) -> io::Result<Takeover> {
    let tombstone = tombstone_path(marker_path);
    match tokio::fs::rename(marker_path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Takeover::Gone),
        Err(e) => return Err(e),
    }

    let current = match read_marker(&tombstone).await {
        Ok(current) => current,
        Err(e) => {
            let _ = restore_marker(&tombstone, marker_path).await;
            return Err(e);
        }
    };
    match current {
        Some(acquired_at) if acquired_at != expired_at => {
            restore_marker(&tombstone, marker_path).await?;
            Ok(Takeover::Replaced(acquired_at))
        }
        _ => {
            remove_if_present(&tombstone).await?;
            Ok(Takeover::Removed)
        }
    }
}

/// Puts a live marker moved to `tombstone` back, unless a newer marker took its place.
async fn restore_marker(tombstone: &Path, marker_path: &Path) -> io::Result<()> {
    match tokio::fs::hard_link(tombstone, marker_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        // filesystems without hard links
        Err(_) => return tokio::fs::rename(tombstone, marker_path).await,
    }
    remove_if_present(tombstone).await
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn tombstone_path(marker_path: &Path) -> PathBuf {
    marker_path.with_file_name(format!(
        "{CLAIM_MARKER_FILE_NAME}.{}.{}.stale",
        std::process::id(),
        TOMBSTONE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ))
}

async fn create_marker(marker_path: &Path, now: DateTime<Utc>) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker_path)
        .await?;
    let written = async {
        file.write_all(now.to_rfc3339().as_bytes()).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        let _ = tokio::fs::remove_file(marker_path).await;
        return Err(e);
    }
    Ok(())
}
