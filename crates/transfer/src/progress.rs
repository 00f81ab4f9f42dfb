//! Progress reporting for running jobs.
//!
//! The controller registers each job with a [`ProgressTracker`] and starts
//! its ticker with the first job. Every tick publishes a snapshot of each
//! active job; a job's final snapshot is published once when it ends.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use chunkflow_protocol::TransferProgress;

use crate::TransferJob;

/// Default progress notification interval.
pub(crate) const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Receives job progress snapshots.
pub type ProgressCallback = Box<dyn Fn(&TransferProgress) + Send + Sync>;

#[derive(Default)]
struct Registry {
    callbacks: RwLock<Vec<ProgressCallback>>,
    jobs: Mutex<BTreeMap<String, Arc<TransferJob>>>,
}

impl Registry {
    fn publish(&self, progress: &TransferProgress) {
        for callback in self.callbacks.read().unwrap().iter() {
            callback(progress);
        }
    }

    /// Snapshots are taken before any callback runs, so a callback never
    /// holds the job map.
    fn publish_active(&self) {
        let snapshots: Vec<TransferProgress> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.is_active())
            .map(|job| job.progress())
            .collect();
        for progress in &snapshots {
            self.publish(progress);
        }
    }
}

/// Publishes progress of registered jobs at a fixed interval.
pub struct ProgressTracker {
    registry: Arc<Registry>,
    interval: Duration,
    ticker: Mutex<Option<CancellationToken>>,
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            interval,
            ticker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Registers a callback for every published snapshot.
    pub fn on_progress(&self, callback: impl Fn(&TransferProgress) + Send + Sync + 'static) {
        self.registry.callbacks.write().unwrap().push(Box::new(callback));
    }

    /// Starts publishing `job` on every tick.
    pub fn track(&self, job: Arc<TransferJob>) {
        self.registry.jobs.lock().unwrap().insert(job.id(), job);
    }

    /// Stops tracking `job_id` and publishes its final snapshot.
    pub fn finish(&self, job_id: &str) {
        let job = self.registry.jobs.lock().unwrap().remove(job_id);
        if let Some(job) = job {
            self.registry.publish(&job.progress());
        }
    }

    /// Number of jobs still tracked.
    pub fn tracked(&self) -> usize {
        self.registry.jobs.lock().unwrap().len()
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Spawns the ticker unless it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_running(&self) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        let stopped = token.clone();
        let registry = Arc::clone(&self.registry);
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticks.tick() => registry.publish_active(),
                }
            }
            tracing::debug!("progress ticker stopped");
        });
        *ticker = Some(token);
    }

    /// Stops the ticker. Tracked jobs stay registered.
    pub fn stop(&self) {
        if let Some(token) = self.ticker.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);
const MAX_SPEED_SAMPLES: usize = 256;

/// Commit rate over a sliding time window.
///
/// The oldest retained sample marks the start of the measured span; only
/// bytes recorded after it count toward the rate.
pub struct SpeedCalculator {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::with_window(DEFAULT_SPEED_WINDOW)
    }
}

impl SpeedCalculator {
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Records `bytes` committed now.
    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((now, bytes));
        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) <= self.window && samples.len() <= MAX_SPEED_SAMPLES {
                break;
            }
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; 0 until two exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        let (Some(&(first, _)), Some(&(last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = last.duration_since(first);
        if span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|&(_, bytes)| bytes).sum();
        bytes as f64 / span.as_secs_f64()
    }

    /// Time to commit `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProgressCheckpoint;
    use chunkflow_protocol::TransferStatus;

    fn sample_job(id: &str) -> Arc<TransferJob> {
        Arc::new(TransferJob::with_id(
            id,
            "/tmp/out.bin",
            1024,
            ProgressCheckpoint::new(512),
        ))
    }

    fn collect(tracker: &ProgressTracker) -> Arc<Mutex<Vec<TransferProgress>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.on_progress(move |p| sink.lock().unwrap().push(p.clone()));
        seen
    }

    #[test]
    fn finish_publishes_final_snapshot_once() {
        let tracker = ProgressTracker::new(DEFAULT_INTERVAL);
        let seen = collect(&tracker);

        let job = sample_job("j1");
        job.start(0);
        job.add_progress(256);
        job.complete();
        tracker.track(job);
        assert_eq!(tracker.tracked(), 1);

        tracker.finish("j1");
        tracker.finish("j1");
        assert_eq!(tracker.tracked(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].job_id, "j1");
        assert_eq!(seen[0].status, TransferStatus::Completed);
        assert_eq!(seen[0].transferred_bytes, 256);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_reports_active_jobs_each_interval() {
        let tracker = ProgressTracker::new(Duration::from_millis(100));
        let seen = collect(&tracker);

        let active = sample_job("active");
        active.start(0);
        tracker.track(active);
        let done = sample_job("done");
        done.complete();
        tracker.track(done);

        tracker.ensure_running();
        tracker.ensure_running();
        assert!(tracker.is_running());
        tokio::time::sleep(Duration::from_millis(350)).await;
        tracker.stop();
        assert!(!tracker.is_running());
        let ticks = seen.lock().unwrap().len();
        assert_eq!(ticks, 3);
        assert!(seen.lock().unwrap().iter().all(|p| p.job_id == "active"));

        // Nothing more once stopped.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(seen.lock().unwrap().len(), ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_restarts_after_stop() {
        let tracker = ProgressTracker::new(Duration::from_millis(50));
        let seen = collect(&tracker);
        let job = sample_job("j1");
        job.start(0);
        tracker.track(job);

        tracker.ensure_running();
        tracker.stop();
        tracker.ensure_running();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn speed_needs_two_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
        calc.record(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_counts_bytes_after_the_first_sample() {
        let calc = SpeedCalculator::default();
        calc.record(9_999);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(1_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(1_000);

        assert_eq!(calc.bytes_per_second(), 1_000.0);
        assert_eq!(calc.eta(5_000), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_leave_the_window() {
        let calc = SpeedCalculator::with_window(Duration::from_secs(2));
        calc.record(1_000_000);
        tokio::time::advance(Duration::from_secs(10)).await;
        calc.record(500);
        // The burst ten seconds ago no longer counts.
        assert_eq!(calc.bytes_per_second(), 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(500);
        assert_eq!(calc.bytes_per_second(), 500.0);
    }

    #[test]
    fn sample_count_is_bounded() {
        let calc = SpeedCalculator::with_window(Duration::from_secs(3600));
        for i in 0..1_000 {
            calc.record(i);
        }
        assert!(calc.samples.lock().unwrap().len() <= MAX_SPEED_SAMPLES);
    }
}
