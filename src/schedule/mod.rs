//! # Schedule Module
//!
//! Fires a capture job on a fixed interval.
//!
//! This module handles:
//! - Arming and disarming an interval timer (`Idle` / `Running`)
//! - Coalescing ticks: a tick that finds a run in flight is skipped
//! - Manual triggers that share the same in-flight slot
//! - Cancelling the token of the in-flight run on `stop`

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ScheduleError;

/// Work run on every tick.
///
/// `cancel` fires when the schedule is stopped; the run should abort any
/// outstanding device requests and discard late results.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSpec {
    pub period: Duration,
    /// Fire once at start instead of after the first period
    pub run_immediately: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    Running,
}

/// Result of a manual trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A run was already in flight
    Coalesced,
    /// The schedule is idle
    NotRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub ticks_coalesced: u64,
}

#[derive(Debug, Default)]
struct Shared {
    in_flight: AtomicBool,
    idle: Notify,
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    ticks_coalesced: AtomicU64,
}

/// Clears the in-flight flag when a run ends, including by panic
struct InFlightGuard(Arc<Shared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.runs_completed.fetch_add(1, Ordering::SeqCst);
        self.0.in_flight.store(false, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

struct Armed {
    job: Arc<dyn ScheduledJob>,
    timer: CancellationToken,
    runs: CancellationToken,
}

/// Interval scheduler with at most one run in flight.
pub struct ScheduleController {
    shared: Arc<Shared>,
    armed: Mutex<Option<Armed>>,
}

impl std::fmt::Debug for ScheduleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleController")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ScheduleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            armed: Mutex::new(None),
        }
    }

    /// Arms the timer. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if armed, `ZeroInterval` for a zero period.
    pub fn start(&self, spec: IntervalSpec, job: Arc<dyn ScheduledJob>) -> Result<(), ScheduleError> {
        let mut armed = lock(&self.armed);
        if armed.is_some() {
            return Err(ScheduleError::AlreadyRunning);
        }
        if spec.period.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }

        let timer = CancellationToken::new();
        let runs = CancellationToken::new();

        let first_tick = if spec.run_immediately {
            Instant::now()
        } else {
            Instant::now() + spec.period
        };
        let mut ticker = tokio::time::interval_at(first_tick, spec.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shared = Arc::clone(&self.shared);
        let loop_job = Arc::clone(&job);
        let loop_timer = timer.clone();
        let loop_runs = runs.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_timer.cancelled() => {
                        debug!("Schedule timer disarmed");
                        break;
                    }
                    _ = ticker.tick() => {
                        launch(&shared, &loop_job, &loop_runs);
                    }
                }
            }
        });

        info!("Schedule started (every {:?}, immediate: {})", spec.period, spec.run_immediately);
        *armed = Some(Armed { job, timer, runs });
        Ok(())
    }

    /// Disarms the timer and cancels the in-flight run's token. The run
    /// itself is left to finish. Idempotent.
    pub fn stop(&self) {
        if let Some(armed) = lock(&self.armed).take() {
            armed.timer.cancel();
            armed.runs.cancel();
            info!("Schedule stopped");
        }
    }

    /// Starts a run now unless one is in flight.
    pub fn trigger_now(&self) -> TriggerOutcome {
        let armed = lock(&self.armed);
        match armed.as_ref() {
            None => TriggerOutcome::NotRunning,
            Some(armed) => {
                if launch(&self.shared, &armed.job, &armed.runs) {
                    TriggerOutcome::Started
                } else {
                    TriggerOutcome::Coalesced
                }
            }
        }
    }

    pub fn state(&self) -> ScheduleState {
        if lock(&self.armed).is_some() {
            ScheduleState::Running
        } else {
            ScheduleState::Idle
        }
    }

    pub fn is_run_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ScheduleStats {
        ScheduleStats {
            runs_started: self.shared.runs_started.load(Ordering::SeqCst),
            runs_completed: self.shared.runs_completed.load(Ordering::SeqCst),
            ticks_coalesced: self.shared.ticks_coalesced.load(Ordering::SeqCst),
        }
    }

    /// Waits until no run is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_run_in_flight() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ScheduleController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns one run if the in-flight slot is free. Returns whether it did.
fn launch(shared: &Arc<Shared>, job: &Arc<dyn ScheduledJob>, runs: &CancellationToken) -> bool {
    if shared
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        shared.ticks_coalesced.fetch_add(1, Ordering::SeqCst);
        debug!("Run still in flight, coalescing tick");
        return false;
    }

    shared.runs_started.fetch_add(1, Ordering::SeqCst);
    let guard = InFlightGuard(Arc::clone(shared));
    let job = Arc::clone(job);
    let cancel = runs.clone();
    tokio::spawn(async move {
        let _guard = guard;
        job.run(cancel).await;
    });
    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts runs and tracks how many overlap
    #[derive(Default)]
    struct CountingJob {
        work: Duration,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        finished: AtomicUsize,
        saw_cancel: AtomicBool,
    }

    impl CountingJob {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run(&self, cancel: CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            if cancel.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn every(ms: u64, run_immediately: bool) -> IntervalSpec {
        IntervalSpec {
            period: Duration::from_millis(ms),
            run_immediately,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let job = CountingJob::new(Duration::ZERO);
        let controller = ScheduleController::new();
        controller.start(every(100, true), job.clone()).unwrap();
        assert_eq!(controller.state(), ScheduleState::Running);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 4);
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_first_tick() {
        let job = CountingJob::new(Duration::ZERO);
        let controller = ScheduleController::new();
        controller.start(every(100, false), job.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_runs_coalesce_ticks() {
        let job = CountingJob::new(Duration::from_millis(250));
        let controller = ScheduleController::new();
        controller.start(every(100, true), job.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        controller.stop();
        controller.wait_idle().await;

        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        let stats = controller.stats();
        assert!(stats.ticks_coalesced > 0);
        assert!(stats.runs_started >= 3);
        assert_eq!(stats.runs_started, stats.runs_completed);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let controller = ScheduleController::new();
        let job = CountingJob::new(Duration::ZERO);
        controller.start(every(1000, false), job.clone()).unwrap();

        let result = controller.start(every(1000, false), job);
        assert!(matches!(result, Err(ScheduleError::AlreadyRunning)));
        controller.stop();
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let controller = ScheduleController::new();
        let result = controller.start(every(0, true), CountingJob::new(Duration::ZERO));
        assert!(matches!(result, Err(ScheduleError::ZeroInterval)));
        assert_eq!(controller.state(), ScheduleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_run_finish() {
        let job = CountingJob::new(Duration::from_millis(500));
        let controller = ScheduleController::new();
        controller.start(every(100, true), job.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), ScheduleState::Idle);
        assert!(controller.is_run_in_flight());

        controller.wait_idle().await;
        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
        assert!(job.saw_cancel.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now() {
        let job = CountingJob::new(Duration::from_millis(200));
        let controller = ScheduleController::new();
        assert_eq!(controller.trigger_now(), TriggerOutcome::NotRunning);

        controller.start(every(10_000, false), job.clone()).unwrap();
        assert_eq!(controller.trigger_now(), TriggerOutcome::Started);
        assert_eq!(controller.trigger_now(), TriggerOutcome::Coalesced);

        controller.wait_idle().await;
        assert_eq!(controller.trigger_now(), TriggerOutcome::Started);
        controller.wait_idle().await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let job = CountingJob::new(Duration::ZERO);
        let controller = ScheduleController::new();
        controller.start(every(100, true), job.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.stop();

        controller.start(every(100, true), job.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        controller.stop();
    }
}
