//! Periodic rollup and retention driver.
//!
//! Two cooperative loops share one stop channel: the aggregation loop
//! fires on wall-clock boundaries aligned to its interval, the cleanup
//! loop prefers a 02:00 UTC slot when its interval is a day or longer.
//! Store calls run on blocking workers so a stop signal or the 30s task
//! timeout abandons a stuck step instead of wedging the loop.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::store::{start_of_day, start_of_month, Granularity, Store, StoreError};

const DEFAULT_AGGREGATE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const TASK_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_HOUR: u32 = 2; // 02:00 UTC

pub struct MetricsScheduler {
    store: Store,
    /// Dropping the sender closes every subscribed receiver; that closed
    /// state is the stop signal, observable any number of times.
    stop: Mutex<Option<broadcast::Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    aggregate_interval: Duration,
    cleanup_interval: Duration,
}

impl MetricsScheduler {
    pub fn new(store: Store, aggregate_interval: Duration, cleanup_interval: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            stop: Mutex::new(Some(stop)),
            handles: Mutex::new(Vec::new()),
            aggregate_interval: if aggregate_interval.is_zero() {
                DEFAULT_AGGREGATE_INTERVAL
            } else {
                aggregate_interval
            },
            cleanup_interval: if cleanup_interval.is_zero() {
                DEFAULT_CLEANUP_INTERVAL
            } else {
                cleanup_interval
            },
        }
    }

    /// Spawn both loops.
    pub fn start(&self) {
        let stop = self.stop.lock().unwrap();
        let Some(stop) = stop.as_ref() else {
            return; // already stopped
        };
        let mut handles = self.handles.lock().unwrap();
        handles.push(tokio::spawn(aggregate_loop(
            self.store.clone(),
            stop.subscribe(),
            self.aggregate_interval,
        )));
        handles.push(tokio::spawn(cleanup_loop(
            self.store.clone(),
            stop.subscribe(),
            self.cleanup_interval,
        )));
    }

    /// Close the stop channel and wait up to 30s for both loops to drain.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        drop(self.stop.lock().unwrap().take());
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        let deadline = Instant::now() + STOP_TIMEOUT;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!("scheduler stop timeout, exiting forcefully");
                return;
            }
        }
    }
}

async fn aggregate_loop(store: Store, mut stop: broadcast::Receiver<()>, every: Duration) {
    let initial = next_aggregate_delay(Utc::now(), every);
    tokio::select! {
        _ = stop.recv() => return,
        _ = tokio::time::sleep(initial) => run_aggregation(&store, &mut stop).await,
    }

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.recv() => return,
            _ = ticker.tick() => run_aggregation(&store, &mut stop).await,
        }
    }
}

async fn cleanup_loop(store: Store, mut stop: broadcast::Receiver<()>, every: Duration) {
    let initial = next_cleanup_delay(Utc::now(), every);
    tokio::select! {
        _ = stop.recv() => return,
        _ = tokio::time::sleep(initial) => run_cleanup(&store, &mut stop).await,
    }

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.recv() => return,
            _ = ticker.tick() => run_cleanup(&store, &mut stop).await,
        }
    }
}

/// Roll raw data forward through the granularity chain. Each step is
/// logged on failure and never blocks the next one.
async fn run_aggregation(store: &Store, stop: &mut broadcast::Receiver<()>) {
    let started = std::time::Instant::now();
    tracing::info!("starting metrics aggregation");
    let now = Utc::now();

    // Raw -> hourly over the last two hours; the overlap re-sums buckets
    // that received late inserts.
    let s = store.clone();
    run_step("aggregate raw->hour", stop, move || {
        s.aggregate_metrics(
            None,
            Granularity::Hourly,
            Some(now - ChronoDuration::hours(2)),
            Some(now),
        )
    })
    .await;

    // Hourly -> daily for yesterday.
    let today = start_of_day(now);
    let s = store.clone();
    run_step("aggregate hour->day", stop, move || {
        s.aggregate_metrics(
            None,
            Granularity::Daily,
            Some(today - ChronoDuration::hours(24)),
            Some(today),
        )
    })
    .await;

    // Daily -> monthly for last month.
    let month_start = start_of_month(now);
    let s = store.clone();
    run_step("aggregate day->month", stop, move || {
        s.aggregate_metrics(
            None,
            Granularity::Monthly,
            Some(month_start - Months::new(1)),
            Some(month_start),
        )
    })
    .await;

    tracing::info!(elapsed = ?started.elapsed(), "metrics aggregation completed");
}

async fn run_cleanup(store: &Store, stop: &mut broadcast::Receiver<()>) {
    let started = std::time::Instant::now();
    tracing::info!("starting retention cleanup");

    let s = store.clone();
    run_step("metrics cleanup", stop, move || {
        s.cleanup_metrics(None, Some(Utc::now()))
    })
    .await;

    let s = store.clone();
    run_step("health history cleanup", stop, move || {
        s.cleanup_health_checks(None)
    })
    .await;

    tracing::info!(elapsed = ?started.elapsed(), "retention cleanup completed");
}

/// Run one store task on a blocking worker under the task timeout. A stop
/// signal abandons the wait; a panicking task is caught at the join
/// boundary so the loop keeps running.
async fn run_step<F>(name: &str, stop: &mut broadcast::Receiver<()>, task: F)
where
    F: FnOnce() -> Result<(), StoreError> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(task);
    tokio::select! {
        result = tokio::time::timeout(TASK_TIMEOUT, handle) => match result {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::error!("{name} failed: {err}"),
            Ok(Err(join_err)) => tracing::error!("{name} panicked: {join_err}"),
            Err(_) => tracing::error!("{name} timed out after {:?}", TASK_TIMEOUT),
        },
        _ = stop.recv() => tracing::warn!("{name} abandoned on shutdown"),
    }
}

/// Delay until the next wall-clock boundary aligned to the interval.
fn next_aggregate_delay(now: DateTime<Utc>, every: Duration) -> Duration {
    let step = every.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let next = now_ms - now_ms.rem_euclid(step) + step;
    Duration::from_millis((next - now_ms) as u64)
}

/// Daily-or-longer cleanup intervals run at 02:00 UTC; shorter ones just
/// use the plain interval.
fn next_cleanup_delay(now: DateTime<Utc>, every: Duration) -> Duration {
    if every >= Duration::from_secs(20 * 60 * 60) {
        let slot = NaiveTime::from_hms_opt(CLEANUP_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
        let mut next = now.date_naive().and_time(slot).and_utc();
        if next <= now {
            next += ChronoDuration::hours(24);
        }
        return (next - now).to_std().unwrap_or_default();
    }
    every
}
