// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Draining of a single spool root.
//!
//! ```text
//!   list buckets ──> claim root ──> for each complete bucket, oldest first:
//!                                     read files ──> append upload ──> delete files + dir
//!                                 ──> release claim
//! ```
//!
//! Source files are only deleted once their bucket is durably appended. Any
//! error stops the sweep of the root and keeps the claim marker, so the
//! remaining buckets are retried once the claim expires. Within one process a
//! root is drained by at most one task at a time, whatever the marker says.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bucket::{drainable_count, SpoolRoot, TimeBucket};
use crate::config::Config;
use crate::error::DrainError;
use crate::lease::{ClaimLease, ClaimOutcome};
use crate::uploader::BlobUploader;

#[async_trait]
pub trait DirectoryProcessor {
    /// Drains the complete buckets of the spool root at `root` and returns how
    /// many were drained. Errors are logged, never returned.
    async fn drain(&self, root: &Path) -> usize;
}

pub struct SpoolDirectoryProcessor {
    uploader: Arc<dyn BlobUploader + Send + Sync>,
    claim_ttl: Duration,
    completeness_age: Duration,
    active_roots: Mutex<HashSet<PathBuf>>,
}

/// Marks a root as being drained by this process until dropped.
struct ActiveRoot<'a> {
    active_roots: &'a Mutex<HashSet<PathBuf>>,
    root: PathBuf,
}

impl Drop for ActiveRoot<'_> {
    fn drop(&mut self) {
        self.active_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.root);
    }
}

impl SpoolDirectoryProcessor {
    pub fn new(
        uploader: Arc<dyn BlobUploader + Send + Sync>,
        claim_ttl: Duration,
        completeness_age: Duration,
    ) -> Self {
        SpoolDirectoryProcessor {
            uploader,
            claim_ttl,
            completeness_age,
            active_roots: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(uploader: Arc<dyn BlobUploader + Send + Sync>, config: &Config) -> Self {
        SpoolDirectoryProcessor::new(uploader, config.claim_ttl, config.bucket_completeness_age)
    }

    /// [`DirectoryProcessor::drain`] evaluated at the instant `now`.
    pub async fn drain_at(&self, root: &Path, now: DateTime<Utc>) -> usize {
        let Some(_active) = self.enter(root) else {
            debug!("DRAIN | {} is already being drained", root.display());
            return 0;
        };

        let spool_root = SpoolRoot::new(root);
        let buckets = match spool_root.buckets().await {
            Ok(buckets) => buckets,
            Err(e) => {
                error!("DRAIN | Failed to list {}: {e}", root.display());
                return 0;
            }
        };
        debug!(
            "DRAIN | Found {} directories in {}",
            buckets.len(),
            root.display()
        );

        let drainable = drainable_count(&buckets, now, self.completeness_age);
        if drainable == 0 {
            return 0;
        }

        let lease = match ClaimLease::acquire(root, self.claim_ttl, now).await {
            Ok(ClaimOutcome::Acquired(lease)) => lease,
            Ok(ClaimOutcome::Held { acquired_at }) => {
                debug!(
                    "DRAIN | {} is claimed by another sweep since {acquired_at}",
                    root.display()
                );
                return 0;
            }
            Err(e) => {
                warn!(
                    "DRAIN | Couldn't create in progress mark file in {}: {e}",
                    root.display()
                );
                return 0;
            }
        };
        if let Some(abandoned_at) = lease.superseded() {
            warn!(
                "DRAIN | Superseding claim on {} abandoned since {abandoned_at}",
                root.display()
            );
        }

        let mut drained = 0;
        for bucket in &buckets[..drainable] {
            debug!("DRAIN | Processing {}", bucket.path().display());
            match self.drain_bucket(&spool_root, bucket).await {
                Ok(Some(files_count)) => {
                    drained += 1;
                    info!(
                        "DRAIN | {} | Uploaded and deleted {files_count} files for {}",
                        spool_root.name(),
                        bucket.name()
                    );
                }
                Ok(None) => warn!(
                    "DRAIN | {} | {} was uploaded but is still on disk, not counting it",
                    spool_root.name(),
                    bucket.name()
                ),
                Err(e) => {
                    // the claim stays in place so the rest is retried after it expires
                    error!("DRAIN | {}: {e}", root.display());
                    return drained;
                }
            }
        }

        if let Err(e) = lease.release().await {
            warn!(
                "DRAIN | Failed to delete in progress mark file {}: {e}",
                ClaimLease::marker_path(root).display()
            );
        }
        drained
    }

    fn enter(&self, root: &Path) -> Option<ActiveRoot<'_>> {
        let mut active = self
            .active_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(root.to_path_buf()) {
            return None;
        }
        Some(ActiveRoot {
            active_roots: &self.active_roots,
            root: root.to_path_buf(),
        })
    }

    /// Uploads every record of `bucket` then deletes it.
    ///
    /// Returns the number of files, or `None` when the bucket directory could
    /// not be removed.
    async fn drain_bucket(
        &self,
        root: &SpoolRoot,
        bucket: &TimeBucket,
    ) -> Result<Option<usize>, DrainError> {
        let files = bucket
            .message_files()
            .await
            .map_err(|e| DrainError::io(bucket.path(), e))?;

        let mut records = Vec::new();
        for file in &files {
            let content = tokio::fs::read(file)
                .await
                .map_err(|e| DrainError::io(file, e))?;
            push_records(&String::from_utf8_lossy(&content), &mut records);
        }

        if !records.is_empty() {
            self.uploader
                .append(&records, root.name(), bucket.name())
                .await
                .map_err(|source| DrainError::Upload {
                    container: root.name().to_string(),
                    path: bucket.name().to_string(),
                    source,
                })?;
        }

        if remove_bucket(bucket, &files).await {
            Ok(Some(files.len()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl DirectoryProcessor for SpoolDirectoryProcessor {
    async fn drain(&self, root: &Path) -> usize {
        self.drain_at(root, Utc::now()).await
    }
}

/// Splits `text` into records on `\n`, `\r\n` or `\r`. A trailing terminator
/// does not produce an empty record.
pub fn push_records(text: &str, records: &mut Vec<String>) {
    let mut rest = text;
    while !rest.is_empty() {
        match rest.find(|c: char| c == '\r' || c == '\n') {
            Some(end) => {
                records.push(rest[..end].to_string());
                let terminator_len = if rest[end..].starts_with("\r\n") { 2 } else { 1 };
                rest = &rest[end + terminator_len..];
            }
            None => {
                records.push(rest.to_string());
                break;
            }
        }
    }
}

/// Deletes the uploaded files, then the bucket directory. Returns whether the
/// directory is gone.
///
/// Failures are only logged: the content is already stored, and whatever is
/// left behind gets uploaded again by a later sweep.
async fn remove_bucket(bucket: &TimeBucket, files: &[PathBuf]) -> bool {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!("DRAIN | Failed to delete uploaded file {}: {e}", file.display());
        }
    }
    match tokio::fs::remove_dir(bucket.path()).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(
                "DRAIN | Failed to delete {} folder: {e}",
                bucket.path().display()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[derive(Default)]
    struct RecordingUploader {
        appended: Mutex<Vec<(String, String, Vec<String>)>>,
        fail_on_path: Option<String>,
    }

    impl RecordingUploader {
        fn failing_on(path: &str) -> Self {
            RecordingUploader {
                fail_on_path: Some(path.to_string()),
                ..Default::default()
            }
        }

        fn appended(&self) -> Vec<(String, String, Vec<String>)> {
            self.appended.lock().unwrap().clone()
        }

        fn paths(&self) -> Vec<String> {
            self.appended().into_iter().map(|(_, path, _)| path).collect()
        }
    }

    #[async_trait]
    impl BlobUploader for RecordingUploader {
        async fn append(
            &self,
            lines: &[String],
            container: &str,
            path: &str,
        ) -> Result<(), UploadError> {
            if self.fail_on_path.as_deref() == Some(path) {
                return Err(UploadError::Status {
                    operation: "append block",
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "unavailable".to_string(),
                });
            }
            self.appended.lock().unwrap().push((
                container.to_string(),
                path.to_string(),
                lines.to_vec(),
            ));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 30, 0).unwrap()
    }

    fn processor(uploader: &Arc<RecordingUploader>) -> SpoolDirectoryProcessor {
        SpoolDirectoryProcessor::new(uploader.clone(), DAY, DAY)
    }

    fn write_message(root: &Path, bucket: &str, file: &str, content: &str) {
        let dir = root.join(bucket);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    fn marker(root: &Path) -> PathBuf {
        ClaimLease::marker_path(root)
    }

    #[tokio::test]
    async fn test_empty_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 0);
        assert!(uploader.appended().is_empty());
        assert!(!marker(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_single_bucket_is_never_drained() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-01-01-00", "m1", "old\n");
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 0);
        assert!(uploader.appended().is_empty());
        assert!(dir.path().join("2024-01-01-00/m1").exists());
    }

    #[tokio::test]
    async fn test_current_bucket_is_withheld() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Orders.BTC");
        write_message(&root, "2024-03-02-10", "m1", "ten\n");
        write_message(&root, "2024-03-02-11", "m1", "eleven\n");
        write_message(&root, "2024-03-02-12", "m1", "twelve\n");
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(&root, now()).await, 2);
        assert_eq!(uploader.paths(), ["2024-03-02-10", "2024-03-02-11"]);
        assert!(uploader
            .appended()
            .iter()
            .all(|(container, _, _)| container == "Orders.BTC"));
        assert!(!root.join("2024-03-02-10").exists());
        assert!(!root.join("2024-03-02-11").exists());
        assert!(root.join("2024-03-02-12/m1").exists());
        assert!(!marker(&root).exists());
    }

    #[tokio::test]
    async fn test_old_last_bucket_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-02-27-10", "m1", "a\n");
        write_message(dir.path(), "2024-02-28-10", "m1", "b\n");
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 2);
        assert_eq!(uploader.paths(), ["2024-02-27-10", "2024-02-28-10"]);
    }

    #[tokio::test]
    async fn test_bucket_records_are_uploaded_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "first", "a\nb\n");
        write_message(dir.path(), "2024-03-02-09", "second", "c");
        write_message(dir.path(), "2024-03-02-12", "m1", "later\n");
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 1);

        let appended = uploader.appended();
        assert_eq!(appended.len(), 1);
        let records = &appended[0].2;
        assert_eq!(records.len(), 3);
        let mut sorted = records.clone();
        sorted.sort();
        assert_eq!(sorted, ["a", "b", "c"]);
        let a = records.iter().position(|r| r == "a").unwrap();
        let b = records.iter().position(|r| r == "b").unwrap();
        assert!(a < b);

        assert!(!dir.path().join("2024-03-02-09").exists());
    }

    #[tokio::test]
    async fn test_fresh_claim_blocks_drain() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-10", "m1", "b\n");
        std::fs::write(marker(dir.path()), "2024-03-02T12:00:00+00:00").unwrap();
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 0);
        assert!(uploader.appended().is_empty());
        assert!(marker(dir.path()).exists());
        assert!(dir.path().join("2024-03-02-09/m1").exists());
    }

    #[tokio::test]
    async fn test_stale_claim_is_superseded() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-10", "m1", "b\n");
        std::fs::write(marker(dir.path()), "2024-02-20T00:00:00+00:00").unwrap();
        let uploader = Arc::new(RecordingUploader::default());

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 1);
        assert!(!marker(dir.path()).exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_upload_failure_keeps_files_and_claim() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-08", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-09", "m1", "b\n");
        write_message(dir.path(), "2024-03-02-10", "m1", "c\n");
        write_message(dir.path(), "2024-03-02-11", "m1", "d\n");
        let uploader = Arc::new(RecordingUploader::failing_on("2024-03-02-09"));

        assert_eq!(processor(&uploader).drain_at(dir.path(), now()).await, 1);

        assert_eq!(uploader.paths(), ["2024-03-02-08"]);
        assert!(!dir.path().join("2024-03-02-08").exists());
        assert!(dir.path().join("2024-03-02-09/m1").exists());
        assert!(dir.path().join("2024-03-02-10/m1").exists());
        assert!(marker(dir.path()).exists());
        assert!(logs_contain("Couldn't save"));
    }

    #[tokio::test]
    async fn test_failed_root_is_retried_after_claim_expires() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-10", "m1", "b\n");

        let failing = Arc::new(RecordingUploader::failing_on("2024-03-02-09"));
        assert_eq!(processor(&failing).drain_at(dir.path(), now()).await, 0);

        let healthy = Arc::new(RecordingUploader::default());
        assert_eq!(processor(&healthy).drain_at(dir.path(), now()).await, 0);

        let later = now() + chrono::Duration::hours(25);
        assert_eq!(processor(&healthy).drain_at(dir.path(), later).await, 2);
        assert_eq!(healthy.paths(), ["2024-03-02-09", "2024-03-02-10"]);
        assert!(!marker(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_rerun_on_processed_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-12", "m1", "b\n");
        let uploader = Arc::new(RecordingUploader::default());
        let processor = processor(&uploader);

        assert_eq!(processor.drain_at(dir.path(), now()).await, 1);
        assert_eq!(processor.drain_at(dir.path(), now()).await, 0);
        assert_eq!(processor.drain_at(dir.path(), now()).await, 0);
        assert_eq!(uploader.appended().len(), 1);
        assert!(!marker(dir.path()).exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bucket_left_on_disk_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        std::fs::create_dir(dir.path().join("2024-03-02-09/nested")).unwrap();
        write_message(dir.path(), "2024-03-02-12", "m1", "b\n");
        let uploader = Arc::new(RecordingUploader::default());
        let processor = processor(&uploader);

        assert_eq!(processor.drain_at(dir.path(), now()).await, 0);
        assert_eq!(uploader.paths(), ["2024-03-02-09"]);
        assert!(!dir.path().join("2024-03-02-09/m1").exists());
        assert!(dir.path().join("2024-03-02-09/nested").exists());
        assert!(!marker(dir.path()).exists());
        assert!(logs_contain("Failed to delete"));
        assert!(logs_contain("not counting it"));

        // later sweeps neither upload nor count the leftover directory
        assert_eq!(processor.drain_at(dir.path(), now()).await, 0);
        assert_eq!(uploader.appended().len(), 1);
        assert!(!marker(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_concurrent_drains_of_one_root_upload_once() {
        let dir = tempfile::tempdir().unwrap();
        write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
        write_message(dir.path(), "2024-03-02-12", "m1", "b\n");
        let uploader = Arc::new(RecordingUploader::default());
        let processor = processor(&uploader);

        let (first, second) = tokio::join!(
            processor.drain_at(dir.path(), now()),
            processor.drain_at(dir.path(), now())
        );

        assert_eq!(first + second, 1);
        assert_eq!(uploader.paths(), ["2024-03-02-09"]);
        assert!(processor.active_roots.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_claim_taken_over_once_by_parallel_sweeps() {
        for _ in 0..50 {
            let dir = tempfile::tempdir().unwrap();
            write_message(dir.path(), "2024-03-02-09", "m1", "a\n");
            write_message(dir.path(), "2024-03-02-12", "m1", "b\n");
            std::fs::write(marker(dir.path()), "2024-02-20T00:00:00+00:00").unwrap();
            let uploader = Arc::new(RecordingUploader::default());
            let processor = Arc::new(processor(&uploader));

            let sweeps: Vec<_> = (0..2)
                .map(|_| {
                    let processor = processor.clone();
                    let root = dir.path().to_path_buf();
                    tokio::spawn(async move { processor.drain_at(&root, now()).await })
                })
                .collect();
            let mut drained = 0;
            for sweep in sweeps {
                drained += sweep.await.unwrap();
            }

            assert_eq!(drained, 1);
            assert_eq!(uploader.appended().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_missing_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        let missing = dir.path().join("gone");
        assert_eq!(processor(&uploader).drain_at(&missing, now()).await, 0);
    }

    #[test]
    fn test_push_records_line_endings() {
        let mut records = Vec::new();
        push_records("a\r\nb\rc\nd", &mut records);
        assert_eq!(records, ["a", "b", "c", "d"]);

        let mut records = Vec::new();
        push_records("a\n\nb\n", &mut records);
        assert_eq!(records, ["a", "", "b"]);

        let mut records = Vec::new();
        push_records("", &mut records);
        assert!(records.is_empty());
    }
}
