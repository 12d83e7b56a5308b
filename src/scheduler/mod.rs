//! Background batch jobs: rollups, trending refresh and raw-event cleanup

pub mod rollup;
pub mod schedule;

pub use schedule::JobKind;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::analytics::AggregationEngine;
use crate::config::SchedulerConfig;
use crate::models::{DateWindow, RollupPeriod};
use crate::storage::RollupStore;
use crate::trends::{TrendEngine, TrendPeriod};

/// Everything before this watermark is covered by daily rollups
pub const DAILY_WATERMARK: &str = "daily_rollup";

/// Days behind the watermark a scheduled daily run retries before its own day
const MAX_CATCH_UP_DAYS: usize = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub failed_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { message: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub job: JobKind,
    pub window: Option<DateWindow>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// `None` when no rollup has completed yet and nothing was purged
    pub cutoff: Option<DateTime<Utc>>,
    pub purged: u64,
}

/// Clears the in-flight flag when the run ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BatchRollupScheduler {
    engine: Arc<AggregationEngine>,
    trends: Arc<TrendEngine>,
    rollups: Arc<dyn RollupStore>,
    config: SchedulerConfig,
    retention: Duration,
    in_flight: HashMap<JobKind, AtomicBool>,
    history: Mutex<VecDeque<RunRecord>>,
}

impl BatchRollupScheduler {
    pub fn new(
        engine: Arc<AggregationEngine>,
        trends: Arc<TrendEngine>,
        rollups: Arc<dyn RollupStore>,
        config: SchedulerConfig,
        retention_days: i64,
    ) -> Self {
        Self {
            engine,
            trends,
            rollups,
            config,
            retention: Duration::days(retention_days),
            in_flight: JobKind::ALL
                .into_iter()
                .map(|kind| (kind, AtomicBool::new(false)))
                .collect(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Spawns one timer task per job
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let handles = JobKind::ALL
            .into_iter()
            .map(|kind| {
                let scheduler = self.clone();
                tokio::spawn(async move { scheduler.run_timer(kind).await })
            })
            .collect();
        info!("Batch scheduler started");
        handles
    }

    async fn run_timer(self: Arc<Self>, kind: JobKind) {
        loop {
            let now = Utc::now();
            let next = kind.next_run_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(job = %kind, next_run = %next, "Job scheduled");
            tokio::time::sleep(wait).await;

            // The run gets its own task so a slow run never delays the timer;
            // an overlapping tick is then recorded as skipped.
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_job(kind, next).await;
            });
        }
    }

    /// Run `kind` as scheduled at `now`, recording the outcome in the history
    pub async fn run_job(&self, kind: JobKind, now: DateTime<Utc>) -> RunRecord {
        let window = self.job_window(kind, now);
        self.run_tracked(kind, window, now).await
    }

    /// Roll up the `period` containing `date`. Used for manual backfills.
    pub async fn run_rollup_for(&self, period: RollupPeriod, date: DateTime<Utc>) -> RunRecord {
        let window = period.window_containing(date);
        self.run_tracked(JobKind::for_period(period), Some(window), Utc::now())
            .await
    }

    /// Most recent first
    pub async fn history(&self) -> Vec<RunRecord> {
        self.history.lock().await.iter().rev().cloned().collect()
    }

    fn job_window(&self, kind: JobKind, now: DateTime<Utc>) -> Option<DateWindow> {
        match kind.rollup_period() {
            Some(period) => Some(period.previous_window(now)),
            None if kind == JobKind::TrendingRefresh => {
                Some(DateWindow::trailing(now, Duration::hours(24)))
            }
            None => None,
        }
    }

    async fn run_tracked(
        &self,
        kind: JobKind,
        window: Option<DateWindow>,
        now: DateTime<Utc>,
    ) -> RunRecord {
        let started_at = Utc::now();
        let record = match self.in_flight.get(&kind).and_then(InFlightGuard::acquire) {
            None => {
                warn!(job = %kind, "Previous run still in flight, skipping tick");
                RunRecord {
                    job: kind,
                    window,
                    started_at,
                    finished_at: Utc::now(),
                    outcome: RunOutcome::Skipped,
                    processed: 0,
                    failed: 0,
                    total: 0,
                }
            }
            Some(_guard) => {
                let result = self.execute(kind, window, now).await;
                let (outcome, report) = match result {
                    Ok(report) => (RunOutcome::Succeeded, report),
                    Err(e) => {
                        error!(job = %kind, error = %e, "Job run failed");
                        (
                            RunOutcome::Failed {
                                message: format!("{e:#}"),
                            },
                            BatchReport::default(),
                        )
                    }
                };
                RunRecord {
                    job: kind,
                    window,
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                    processed: report.processed,
                    failed: report.failed,
                    total: report.total,
                }
            }
        };

        let mut history = self.history.lock().await;
        history.push_back(record.clone());
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
        record
    }

    async fn execute(
        &self,
        kind: JobKind,
        window: Option<DateWindow>,
        now: DateTime<Utc>,
    ) -> Result<BatchReport> {
        match (kind.rollup_period(), window) {
            (Some(RollupPeriod::Day), Some(window)) => self.daily_rollup(window).await,
            (Some(period), Some(window)) => self.rollup(period, window).await,
            (Some(_), None) => Err(anyhow!("rollup job without a window")),
            (None, _) if kind == JobKind::TrendingRefresh => self.refresh_trending(now).await,
            (None, _) => {
                let report = self.cleanup(now).await?;
                let purged = report.purged as usize;
                Ok(BatchReport {
                    processed: purged,
                    failed: 0,
                    total: purged,
                    failed_links: Vec::new(),
                })
            }
        }
    }

    /// Compute and upsert rollups for every link active in `window`.
    ///
    /// Per-link failures are counted and skipped; only failing to list the
    /// active links aborts the run.
    pub async fn rollup(&self, period: RollupPeriod, window: DateWindow) -> Result<BatchReport> {
        let links = rollup::active_links(self.engine.store().as_ref(), window)
            .await
            .context("failed to enumerate active links")?;
        let total = links.len();
        info!(
            period = period.as_str(),
            start = %window.start,
            end = %window.end,
            links = total,
            "Starting rollup run"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let timeout = std::time::Duration::from_secs(self.config.link_timeout_secs);
        let mut tasks = JoinSet::new();

        for link_id in links.iter().cloned() {
            let semaphore = semaphore.clone();
            let engine = self.engine.clone();
            let rollups = self.rollups.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let work = async {
                    let record = rollup::compute_rollup(&engine, &link_id, period, window).await?;
                    rollups.upsert_rollup(&record).await
                };
                let outcome = match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {}s", timeout.as_secs())),
                };
                match outcome {
                    Ok(()) => Ok(link_id),
                    Err(e) => Err(anyhow!("link {link_id}: {e:#}")),
                }
            });
        }

        let mut succeeded = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(link_id)) => {
                    succeeded.insert(link_id);
                }
                Ok(Err(e)) => error!(period = period.as_str(), error = %e, "Rollup failed for link"),
                Err(e) => error!(period = period.as_str(), error = %e, "Rollup task aborted"),
            }
        }

        let failed_links: Vec<String> = links
            .into_iter()
            .filter(|link_id| !succeeded.contains(link_id))
            .collect();
        let report = BatchReport {
            processed: succeeded.len(),
            failed: failed_links.len(),
            total,
            failed_links,
        };

        if period == RollupPeriod::Day {
            self.settle_daily_watermark(window, report.failed)
                .await
                .context("failed to advance rollup watermark")?;
        }

        info!(
            period = period.as_str(),
            processed = report.processed,
            failed = report.failed,
            total = report.total,
            "Rollup run finished"
        );
        Ok(report)
    }

    /// Scheduled daily run: first retry days left behind the watermark by
    /// earlier failures (oldest first, at most [`MAX_CATCH_UP_DAYS`]), then
    /// roll up `target`.
    async fn daily_rollup(&self, target: DateWindow) -> Result<BatchReport> {
        let mut windows = Vec::new();
        if let Some(mark) = self.rollups.get_watermark(DAILY_WATERMARK).await? {
            let mut day = RollupPeriod::Day.window_containing(mark);
            while day.start < target.start && windows.len() < MAX_CATCH_UP_DAYS {
                windows.push(day);
                day = RollupPeriod::Day.window_containing(day.end);
            }
        }
        if !windows.is_empty() {
            warn!(
                days = windows.len(),
                from = %windows[0].start,
                "Daily rollups behind the watermark, catching up"
            );
        }
        windows.push(target);

        let mut report = BatchReport::default();
        for window in windows {
            let day = self.rollup(RollupPeriod::Day, window).await?;
            report.processed += day.processed;
            report.failed += day.failed;
            report.total += day.total;
            report.failed_links.extend(day.failed_links);
        }
        Ok(report)
    }

    /// The daily watermark only moves over a day once that day and every day
    /// before it rolled up without failures. A failed day with no watermark
    /// yet pins it to the day's start so later clean days cannot skip it.
    async fn settle_daily_watermark(&self, window: DateWindow, failed: usize) -> Result<()> {
        let current = self.rollups.get_watermark(DAILY_WATERMARK).await?;
        let next = match (current, failed) {
            (None, 0) => Some(window.end),
            (None, _) => Some(window.start),
            (Some(mark), 0) if window.start <= mark => Some(window.end),
            _ => None,
        };
        match next {
            Some(next) => self.rollups.advance_watermark(DAILY_WATERMARK, next).await,
            None => {
                warn!(
                    start = %window.start,
                    failed,
                    "Daily watermark held back until earlier days roll up cleanly"
                );
                Ok(())
            }
        }
    }

    /// Re-cache the day trending view for every owner with clicks in the last 24h
    pub async fn refresh_trending(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let owners = self
            .engine
            .active_owners(DateWindow::trailing(now, Duration::hours(24)))
            .await
            .context("failed to enumerate active owners")?;

        let mut report = BatchReport {
            total: owners.len(),
            ..BatchReport::default()
        };
        for owner in owners {
            match self.trends.refresh_for_user(&owner, TrendPeriod::Day).await {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!(user_id = %owner, error = %e, "Trending refresh failed for user");
                    report.failed += 1;
                }
            }
        }
        info!(
            processed = report.processed,
            failed = report.failed,
            "Trending refresh finished"
        );
        Ok(report)
    }

    /// Purge raw events older than the retention horizon, never past the
    /// daily rollup watermark
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let Some(watermark) = self.rollups.get_watermark(DAILY_WATERMARK).await? else {
            warn!("No completed daily rollup yet, skipping cleanup");
            return Ok(CleanupReport {
                cutoff: None,
                purged: 0,
            });
        };

        let cutoff = (now - self.retention).min(watermark);
        let purged = self
            .engine
            .store()
            .purge_before(cutoff)
            .await
            .context("failed to purge expired events")?;
        info!(cutoff = %cutoff, purged, "Cleanup finished");
        Ok(CleanupReport {
            cutoff: Some(cutoff),
            purged,
        })
    }

    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        self.rollups.get_watermark(DAILY_WATERMARK).await
    }
}
