// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic sweeps over every spool root with an adaptive worker count.
//!
//! Each cycle waits for the readiness gate, queues every spool root and lets
//! a pool of staggered workers drain the queue. The number of buckets drained
//! then feeds [`WorkerPoolState::retune`], which picks the worker count of
//! the next cycle.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bucket::SpoolRoot;
use crate::config::Config;
use crate::constants::{
    BUSY_THRESHOLD, IDLE_GRACE_PERIOD, WORKERS_SCALE_DOWN_STEP, WORKERS_SCALE_UP_STEP,
};
use crate::directory_processor::DirectoryProcessor;
use crate::error::ReadinessError;
use crate::readiness::{wait_until_ready, ReadinessBackoff, ReadinessProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Unchanged,
    ScaledUp { from: usize, to: usize },
    ScaledDown { from: usize, to: usize },
}

/// Worker count tuning state, carried from one cycle to the next.
///
/// Busy cycles (more than [`BUSY_THRESHOLD`] buckets drained) scale up by
/// [`WORKERS_SCALE_UP_STEP`], except the first busy cycle after startup or
/// after a scale down, and except a busy cycle ending an idle period. Idle
/// cycles scale down by [`WORKERS_SCALE_DOWN_STEP`] once the idle period
/// lasted [`IDLE_GRACE_PERIOD`].
#[derive(Debug, Clone)]
pub struct WorkerPoolState {
    min: usize,
    max: usize,
    workers: usize,
    idle_since: Option<Instant>,
    first_busy_pending: bool,
    last_adjustment: Adjustment,
}

impl WorkerPoolState {
    /// Starts at the midpoint of `[min, max]`.
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        WorkerPoolState {
            min,
            max,
            workers: min + (max - min) / 2,
            idle_since: None,
            first_busy_pending: true,
            last_adjustment: Adjustment::Unchanged,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        WorkerPoolState::new(config.workers_min_count, config.workers_max_count)
    }

    pub fn workers_count(&self) -> usize {
        self.workers
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub fn last_adjustment(&self) -> Adjustment {
        self.last_adjustment
    }

    /// Picks the worker count following a cycle started at `cycle_started_at`
    /// which drained `total_processed` buckets.
    pub fn retune(&mut self, total_processed: usize, cycle_started_at: Instant) -> Adjustment {
        let from = self.workers;
        let adjustment = if total_processed > BUSY_THRESHOLD {
            if self.idle_since.take().is_some() {
                Adjustment::Unchanged
            } else if self.first_busy_pending {
                self.first_busy_pending = false;
                Adjustment::Unchanged
            } else if self.workers < self.max {
                self.workers = (self.workers + WORKERS_SCALE_UP_STEP).min(self.max);
                Adjustment::ScaledUp {
                    from,
                    to: self.workers,
                }
            } else {
                Adjustment::Unchanged
            }
        } else {
            match self.idle_since {
                None => {
                    self.idle_since = Some(cycle_started_at);
                    Adjustment::Unchanged
                }
                Some(since)
                    if cycle_started_at.saturating_duration_since(since) >= IDLE_GRACE_PERIOD
                        && self.workers > self.min =>
                {
                    self.workers = self
                        .workers
                        .saturating_sub(WORKERS_SCALE_DOWN_STEP)
                        .max(self.min);
                    self.idle_since = None;
                    self.first_busy_pending = true;
                    Adjustment::ScaledDown {
                        from,
                        to: self.workers,
                    }
                }
                Some(_) => Adjustment::Unchanged,
            }
        };
        if adjustment != Adjustment::Unchanged {
            self.last_adjustment = adjustment;
        }
        adjustment
    }
}

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Spool roots found under the disk path
    pub roots: usize,
    /// Workers actually started
    pub workers: usize,
    /// Buckets drained across all roots
    pub total_processed: usize,
    /// Roots where at least one bucket was drained
    pub processed_roots: Vec<PathBuf>,
}

pub struct AdaptiveScheduler {
    disk_path: PathBuf,
    sweep_period: Duration,
    worker_stagger: Duration,
    readiness_backoff: ReadinessBackoff,
    processor: Arc<dyn DirectoryProcessor + Send + Sync>,
    probe: Arc<dyn ReadinessProbe + Send + Sync>,
    ready: AtomicBool,
}

impl AdaptiveScheduler {
    pub fn new(
        config: &Config,
        processor: Arc<dyn DirectoryProcessor + Send + Sync>,
        probe: Arc<dyn ReadinessProbe + Send + Sync>,
    ) -> Self {
        AdaptiveScheduler {
            disk_path: config.disk_path.clone(),
            sweep_period: config.sweep_period,
            worker_stagger: config.worker_stagger,
            readiness_backoff: config.readiness_backoff,
            processor,
            probe,
            ready: AtomicBool::new(false),
        }
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    /// Runs a cycle every sweep period until `cancel` fires, then waits for
    /// the cycles still in flight.
    ///
    /// Cycles are not mutually exclusive: a slow cycle keeps running while
    /// the next one starts, and the claim markers keep them off each other's
    /// roots.
    pub async fn run(self: Arc<Self>, state: WorkerPoolState, cancel: CancellationToken) {
        let state = Arc::new(Mutex::new(state));
        let mut ticker = tokio::time::interval(self.sweep_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = finished {
                        error!("SCHEDULER | Sweep cycle task failed: {e}");
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let scheduler = Arc::clone(&self);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            cycles.spawn(async move { scheduler.sweep_shared(&state, &cancel).await });
        }

        info!(
            "SCHEDULER | Shutting down, waiting for {} sweep cycles",
            cycles.len()
        );
        while let Some(finished) = cycles.join_next().await {
            if let Err(e) = finished {
                error!("SCHEDULER | Sweep cycle task failed: {e}");
            }
        }
    }

    /// Runs one cycle with the worker count of `state`, then retunes `state`.
    pub async fn sweep_once(
        &self,
        state: &mut WorkerPoolState,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, ReadinessError> {
        let started_at = Instant::now();
        let report = self.run_cycle(state.workers_count(), cancel).await?;
        let adjustment = state.retune(report.total_processed, started_at);
        log_cycle(&report, adjustment);
        Ok(report)
    }

    async fn sweep_shared(&self, state: &Mutex<WorkerPoolState>, cancel: &CancellationToken) {
        let started_at = Instant::now();
        let workers = state.lock().await.workers_count();
        match self.run_cycle(workers, cancel).await {
            Ok(report) => {
                let adjustment = state
                    .lock()
                    .await
                    .retune(report.total_processed, started_at);
                log_cycle(&report, adjustment);
            }
            Err(ReadinessError::Cancelled) => {
                debug!("SCHEDULER | Sweep cycle cancelled before the readiness gate opened");
            }
        }
    }

    /// Drains every spool root once with up to `workers` concurrent workers.
    ///
    /// Worker `i` starts after `i` stagger periods. Once `cancel` fires,
    /// workers that have not started are dropped and the others stop taking
    /// roots from the queue.
    pub async fn run_cycle(
        &self,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, ReadinessError> {
        if !self.ready.load(Ordering::Acquire) {
            wait_until_ready(self.probe.as_ref(), &self.readiness_backoff, cancel).await?;
            self.ready.store(true, Ordering::Release);
        }

        let roots = match SpoolRoot::discover(&self.disk_path).await {
            Ok(roots) => roots,
            Err(e) => {
                error!(
                    "SCHEDULER | Failed to list spool roots in {}: {e}",
                    self.disk_path.display()
                );
                return Ok(CycleReport::default());
            }
        };
        let roots_count = roots.len();
        // workers past the number of roots would always find the queue empty
        let workers = workers.max(1).min(roots_count);

        let queue: Arc<Mutex<VecDeque<PathBuf>>> = Arc::new(Mutex::new(
            roots.into_iter().map(|root| root.path().to_path_buf()).collect(),
        ));
        let total_processed = Arc::new(AtomicUsize::new(0));
        let processed_roots = Arc::new(Mutex::new(Vec::new()));

        let mut pool = JoinSet::new();
        for index in 0..workers {
            let worker = Worker {
                index,
                start_delay: self
                    .worker_stagger
                    .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX)),
                queue: Arc::clone(&queue),
                processor: Arc::clone(&self.processor),
                total_processed: Arc::clone(&total_processed),
                processed_roots: Arc::clone(&processed_roots),
                cancel: cancel.clone(),
            };
            pool.spawn(worker.run());
        }
        while let Some(finished) = pool.join_next().await {
            if let Err(e) = finished {
                error!("SCHEDULER | Worker task failed: {e}");
            }
        }

        let processed_roots = std::mem::take(&mut *processed_roots.lock().await);
        Ok(CycleReport {
            roots: roots_count,
            workers,
            total_processed: total_processed.load(Ordering::Acquire),
            processed_roots,
        })
    }
}

struct Worker {
    index: usize,
    start_delay: Duration,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    processor: Arc<dyn DirectoryProcessor + Send + Sync>,
    total_processed: Arc<AtomicUsize>,
    processed_roots: Arc<Mutex<Vec<PathBuf>>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        if !self.start_delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.start_delay) => {}
            }
        }
        while !self.cancel.is_cancelled() {
            let Some(root) = self.queue.lock().await.pop_front() else {
                break;
            };
            let drained = self.processor.drain(&root).await;
            debug!(
                "SCHEDULER | Worker {} drained {drained} buckets in {}",
                self.index,
                root.display()
            );
            if drained > 0 {
                self.total_processed.fetch_add(drained, Ordering::AcqRel);
                self.processed_roots.lock().await.push(root);
            }
        }
    }
}

fn log_cycle(report: &CycleReport, adjustment: Adjustment) {
    info!(
        "SCHEDULER | Directories are processed: {} buckets drained in {} of {} roots with {} workers",
        report.total_processed,
        report.processed_roots.len(),
        report.roots,
        report.workers
    );
    match adjustment {
        Adjustment::ScaledUp { from, to } => {
            info!("SCHEDULER | Increased workers count from {from} to {to}");
        }
        Adjustment::ScaledDown { from, to } => {
            info!("SCHEDULER | Decreased workers count from {from} to {to}");
        }
        Adjustment::Unchanged => {}
    }
}
