use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vitrine_core::{CoreError, VitrineConfig};

use crate::cadence::Cadence;
use crate::connection::StoreAddress;
use crate::job::Job;

/// Validated trigger settings. Building them is the fail-fast startup check:
/// a missing or malformed store address, or a bad cadence, is rejected
/// before the loop starts.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub cadence: Cadence,
    pub store_address: StoreAddress,
}

impl TriggerSettings {
    pub fn from_config(config: &VitrineConfig) -> Result<Self, CoreError> {
        let url = config
            .store
            .url()
            .ok_or_else(|| CoreError::Config("store.url is required".to_string()))?;
        let store_address =
            StoreAddress::parse(url).map_err(|e| CoreError::Config(e.to_string()))?;
        let cadence = Cadence::parse(&config.publisher.cadence)?;
        Ok(Self {
            cadence,
            store_address,
        })
    }
}

/// Counters updated by the trigger loop.
#[derive(Debug, Default)]
pub struct TriggerStats {
    ticks: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
}

/// Point-in-time copy of [`TriggerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerSnapshot {
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub published: u64,
}

impl TriggerStats {
    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// Clears the in-flight flag when the run finishes, including by panic.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives a [`Job`] on a [`Cadence`] for the lifetime of the process.
///
/// Fires once immediately, then at every cadence boundary. A tick that lands
/// while the previous run is still going is skipped. Run errors and panics
/// are logged and counted; they never end the loop.
pub struct Trigger<J: Job> {
    job: Arc<J>,
    cadence: Cadence,
    stats: Arc<TriggerStats>,
    in_flight: Arc<AtomicBool>,
}

impl<J: Job> Trigger<J> {
    pub fn new(job: Arc<J>, cadence: Cadence) -> Self {
        Self {
            job,
            cadence,
            stats: Arc::new(TriggerStats::default()),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<TriggerStats> {
        Arc::clone(&self.stats)
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` (or its sender is
    /// dropped), then waits for an in-flight run to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(job = self.job.name(), cadence = %self.cadence, "publication trigger started");

        let mut running = self.tick(None);
        let mut last_fired = Utc::now();
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&self.cadence, now, last_fired) else {
                warn!(cadence = %self.cadence, "cadence has no future fire time; trigger idle");
                let _ = shutdown.wait_for(|stop| *stop).await;
                break;
            };
            let delay = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    last_fired = next;
                    running = self.tick(running);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("publication trigger shutting down");
        if let Some(handle) = running {
            if let Err(e) = handle.await {
                error!(error = %e, "in-flight publication run aborted during shutdown");
            }
        }
        info!(stats = ?self.stats.snapshot(), "publication trigger stopped");
    }

    /// Start a run unless one is in flight; returns the handle to keep.
    fn tick(&self, previous: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let Some(guard) = InFlight::try_acquire(&self.in_flight) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(job = self.job.name(), "previous run still in flight; skipping tick");
            return previous;
        };

        let job = Arc::clone(&self.job);
        let stats = Arc::clone(&self.stats);
        Some(tokio::spawn(async move {
            let _guard = guard;
            match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(Ok(report)) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    stats
                        .published
                        .fetch_add(report.updated_count as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(job = job.name(), code = e.code(), error = %e, "scheduled run failed");
                }
                Err(_) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(job = job.name(), "scheduled run panicked");
                }
            }
        }))
    }
}

/// Next fire time after both `now` and the boundary that last fired.
///
/// The sleep runs on the monotonic clock while boundaries come from the wall
/// clock; waking a hair early must not fire the same boundary twice.
fn next_fire(
    cadence: &Cadence,
    now: DateTime<Utc>,
    last_fired: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    cadence.next_after(now.max(last_fired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError, PublishError};
    use crate::job::PublishReport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn report(n: usize) -> PublishReport {
        PublishReport {
            updated_count: n,
            ids: (0..n).map(|i| format!("item-{i}")).collect(),
            ran_at: Utc::now(),
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl Job for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        async fn run(&self) -> Result<PublishReport, PublishError> {
            Ok(report(1))
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl Job for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }
        async fn run(&self) -> Result<PublishReport, PublishError> {
            Err(PublishError::Connection(ConnectionError::Unreachable(
                "intentional failure".to_string(),
            )))
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        async fn run(&self) -> Result<PublishReport, PublishError> {
            panic!("intentional panic");
        }
    }

    /// Sleeps for `duration` and records the highest observed concurrency.
    struct Slow {
        duration: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        completed: AtomicUsize,
    }

    impl Slow {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Job for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn run(&self) -> Result<PublishReport, PublishError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(report(0))
        }
    }

    fn every(ms: u64) -> Cadence {
        Cadence::Every(Duration::from_millis(ms))
    }

    /// Run `trigger` for `window`, then shut it down and wait for it.
    async fn run_for<J: Job>(trigger: Trigger<J>, window: Duration) -> TriggerSnapshot {
        let stats = trigger.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(trigger.run(shutdown_rx));
        tokio::time::sleep(window).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        stats.snapshot()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_immediately_on_start() {
        let trigger = Trigger::new(Arc::new(AlwaysOk), every(3_600_000));
        let stats = run_for(trigger, Duration::from_millis(100)).await;
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_do_not_stop_the_loop() {
        let trigger = Trigger::new(Arc::new(AlwaysFail), every(20));
        let stats = run_for(trigger, Duration::from_millis(200)).await;
        assert!(stats.failed >= 3, "expected repeated runs, got {stats:?}");
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panics_do_not_stop_the_loop() {
        let trigger = Trigger::new(Arc::new(Panics), every(20));
        let stats = run_for(trigger, Duration::from_millis(200)).await;
        assert!(stats.failed >= 3, "expected repeated runs, got {stats:?}");
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_ticks_are_skipped() {
        let job = Slow::new(Duration::from_millis(120));
        let trigger = Trigger::new(Arc::clone(&job), every(10));
        let stats = run_for(trigger, Duration::from_millis(400)).await;

        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        assert!(stats.skipped >= 1, "expected skipped ticks, got {stats:?}");
        assert_eq!(stats.ticks, stats.succeeded + stats.skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_in_flight_run() {
        let job = Slow::new(Duration::from_millis(150));
        let trigger = Trigger::new(Arc::clone(&job), every(3_600_000));
        run_for(trigger, Duration::from_millis(20)).await;
        assert_eq!(job.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_wake_does_not_refire_the_same_boundary() {
        use chrono::TimeZone;

        let cadence = Cadence::parse("* * * * *").unwrap();
        let boundary = Utc.with_ymd_and_hms(2026, 10, 19, 10, 31, 0).unwrap();
        let woke_early = boundary - chrono::Duration::milliseconds(1);

        assert_eq!(
            next_fire(&cadence, woke_early, boundary),
            Some(boundary + chrono::Duration::minutes(1))
        );
        // Late wake-ups still follow the wall clock.
        let woke_late = boundary + chrono::Duration::seconds(5);
        assert_eq!(
            next_fire(&cadence, woke_late, boundary),
            Some(boundary + chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn settings_require_store_address() {
        let err = TriggerSettings::from_config(&VitrineConfig::default()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn settings_reject_malformed_address_and_cadence() {
        let mut config = VitrineConfig::default();
        config.store.url = Some("redis://localhost".to_string());
        assert!(TriggerSettings::from_config(&config).is_err());

        config.store.url = Some("sqlite::memory:".to_string());
        config.publisher.cadence = "every now and then".to_string();
        assert!(TriggerSettings::from_config(&config).is_err());

        config.publisher.cadence = "*/2 * * * *".to_string();
        let settings = TriggerSettings::from_config(&config).unwrap();
        assert_eq!(settings.store_address, StoreAddress::Memory);
    }
}
