//! Periodic polling of every active feed, plus retention cleanup.
//!
//! Each tick lists the active feeds, drops the ones backing off or still
//! running from an earlier tick, shuffles the rest and starts each after a
//! random delay. A semaphore bounds how many cycles run at once. Missed
//! ticks are skipped, not replayed.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::feed::{CycleReport, FeedCycle};
use crate::storage::Feed;
use crate::util::now_unix;

/// Result of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub entries: u64,
    pub translations: u64,
}

pub struct Scheduler {
    cycle: FeedCycle,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// Marks a feed as scheduled until dropped, including on abort or panic.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<i64>>>,
    feed_id: i64,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<i64>>>, feed_id: i64) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(feed_id);
        inserted.then(|| Self {
            set: Arc::clone(set),
            feed_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.feed_id);
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl Scheduler {
    pub fn new(cycle: FeedCycle, config: SchedulerConfig) -> Self {
        Self {
            cycle,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Poll until `shutdown` flips to `true`.
    ///
    /// On shutdown no new cycles start (including ones still waiting for
    /// their jitter delay or a worker slot); running cycles get
    /// `shutdown_grace` to finish before they are aborted.
    pub async fn run_forever(
        &self,
        interval: Duration,
        concurrency_limit: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks: JoinSet<Option<CycleReport>> = JoinSet::new();

        tracing::info!(
            interval_secs = interval.as_secs(),
            concurrency = concurrency_limit,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    let started = self.schedule_tick(&mut tasks, &semaphore, interval, &shutdown).await;
                    tracing::debug!(started = started, running = tasks.len(), "Tick");
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        self.drain(tasks).await;
        tracing::info!("Scheduler stopped");
    }

    /// Run a single tick without jitter and wait for every cycle it started.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
        // Sender stays alive for the whole call, so this never fires.
        let (_keep, shutdown) = watch::channel(false);
        let mut tasks = JoinSet::new();

        self.schedule_tick(&mut tasks, &semaphore, Duration::ZERO, &shutdown)
            .await;

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(report)) = &joined {
                reports.push(report.clone());
            }
            log_joined(joined);
        }
        reports.sort_by_key(|r| r.feed_id);
        reports
    }

    /// Spawn a cycle for every eligible feed. Returns how many were started.
    ///
    /// Each start is delayed by a random amount below
    /// `min(spread / feeds, max_jitter)`; a zero `spread` starts all at once.
    async fn schedule_tick(
        &self,
        tasks: &mut JoinSet<Option<CycleReport>>,
        semaphore: &Arc<Semaphore>,
        spread: Duration,
        shutdown: &watch::Receiver<bool>,
    ) -> usize {
        let feeds = match self.cycle.db().list_active_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list feeds, skipping tick");
                return 0;
            }
        };

        let now = now_unix();
        let mut due: Vec<(Feed, InFlightGuard)> = Vec::with_capacity(feeds.len());
        for feed in feeds {
            if feed.is_backing_off(now) {
                tracing::debug!(feed_id = feed.id, until = feed.backoff_until, "Feed backing off");
                continue;
            }
            match InFlightGuard::claim(&self.in_flight, feed.id) {
                Some(guard) => due.push((feed, guard)),
                None => tracing::debug!(feed_id = feed.id, "Previous cycle still running, skipping"),
            }
        }

        if due.is_empty() {
            return 0;
        }

        due.shuffle(&mut rand::thread_rng());

        let slot = (spread / due.len() as u32).min(self.config.max_jitter());
        let started = due.len();

        for (feed, guard) in due {
            let delay = if slot.is_zero() {
                Duration::ZERO
            } else {
                rand::thread_rng().gen_range(Duration::ZERO..slot)
            };
            let cycle = self.cycle.clone();
            let semaphore = Arc::clone(semaphore);
            let mut shutdown = shutdown.clone();

            tasks.spawn(async move {
                let _guard = guard;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => return None,
                }
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok()?,
                    _ = shutdown_requested(&mut shutdown) => return None,
                };

                match cycle.run_cycle(&feed).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::error!(
                            feed_id = feed.id,
                            url = %feed.url,
                            error = %e,
                            "Feed cycle failed"
                        );
                        None
                    }
                }
            });
        }

        started
    }

    async fn drain(&self, mut tasks: JoinSet<Option<CycleReport>>) {
        if tasks.is_empty() {
            return;
        }
        let grace = self.config.shutdown_grace();
        tracing::info!(
            running = tasks.len(),
            grace_secs = grace.as_secs(),
            "Waiting for running feed cycles"
        );

        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_joined(joined);
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(remaining = tasks.len(), "Grace period over, aborting feed cycles");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    /// Prune entries and cached translations older than `retention` every
    /// `interval`, starting immediately, until shutdown.
    pub async fn run_cleanup_forever(
        &self,
        interval: Duration,
        retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup_once(retention).await {
                        tracing::warn!(error = %e, "Retention cleanup failed");
                    }
                }
            }
        }
    }

    pub async fn cleanup_once(&self, retention: Duration) -> anyhow::Result<CleanupReport> {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now_unix().saturating_sub(retention);
        let db = self.cycle.db();
        let report = CleanupReport {
            entries: db.prune_entries_before(cutoff).await?,
            translations: db.prune_translations_before(cutoff).await?,
        };
        if report.entries > 0 || report.translations > 0 {
            tracing::info!(
                entries = report.entries,
                translations = report.translations,
                "Pruned old rows"
            );
        }
        Ok(report)
    }
}

fn log_joined(joined: Result<Option<CycleReport>, JoinError>) {
    match joined {
        Ok(_) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "Feed cycle panicked"),
    }
}
