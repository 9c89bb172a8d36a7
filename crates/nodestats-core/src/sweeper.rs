//! Periodic expiry of time-bounded log streams.
//!
//! One dedicated thread wakes on a [`crossbeam::channel::tick`] and asks every
//! registered stream to drop records older than its configured expiry. The
//! thread keeps ticking whatever a single sweep does, including panicking,
//! until its [`SweeperHandle`] is shut down or dropped.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Sender, bounded, select, tick};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::log_stream::LogStream;
use crate::records::{LogEntry, epoch_ms};

/// Remove every entry logged strictly before `now_ms - expiry_ms`.
///
/// Returns the number of entries removed. Calling it twice with the same
/// arguments removes nothing the second time.
pub fn remove_expired<T: LogEntry>(entries: &mut VecDeque<T>, now_ms: i64, expiry_ms: i64) -> usize {
    let cutoff = now_ms.saturating_sub(expiry_ms);
    let before = entries.len();
    entries.retain(|entry| entry.logged_at_ms() >= cutoff);
    before - entries.len()
}

/// Anything the sweeper can age.
pub trait Sweepable: Send + Sync {
    /// Name used in sweep logs.
    fn name(&self) -> &str;

    /// Drop records that expired at `now_ms`; returns how many went.
    fn sweep(&self, now_ms: i64) -> usize;
}

impl<T: LogEntry + Send> Sweepable for LogStream<T> {
    fn name(&self) -> &str {
        LogStream::name(self)
    }

    fn sweep(&self, now_ms: i64) -> usize {
        self.remove_expired(now_ms)
    }
}

/// Entry point for the sweep thread.
pub struct ExpirySweeper;

impl ExpirySweeper {
    /// Start sweeping `streams` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the interval is zero or the thread
    /// cannot be spawned.
    pub fn spawn(streams: Vec<Arc<dyn Sweepable>>, interval: Duration) -> Result<SweeperHandle> {
        if interval.is_zero() {
            return Err(Error::Runtime("sweep interval must be greater than zero".into()));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let worker_ticks = Arc::clone(&ticks);
        let interval_ms = interval.as_millis() as u64;

        let thread = std::thread::Builder::new()
            .name("stats-expiry-sweeper".into())
            .spawn(move || {
                let timer = tick(interval);
                loop {
                    select! {
                        recv(timer) -> _ => {
                            sweep_all(&streams, epoch_ms());
                            worker_ticks.fetch_add(1, Ordering::Relaxed);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Expiry sweeper stopped");
            })?;

        info!(interval_ms, "Expiry sweeper started");
        Ok(SweeperHandle {
            interval,
            ticks,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Run one sweep over every stream. A panicking stream is logged and
/// skipped; the others are still swept.
pub fn sweep_all(streams: &[Arc<dyn Sweepable>], now_ms: i64) -> usize {
    let mut total = 0;
    for stream in streams {
        match catch_unwind(AssertUnwindSafe(|| stream.sweep(now_ms))) {
            Ok(removed) => total += removed,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(stream = stream.name(), %reason, "Expiry sweep failed");
            }
        }
    }
    total
}

/// Owner of the running sweep thread. Dropping it stops the thread.
pub struct SweeperHandle {
    interval: Duration,
    ticks: Arc<AtomicU64>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of completed ticks.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Expiry sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for SweeperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperHandle")
            .field("interval", &self.interval)
            .field("ticks", &self.ticks())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetentionPolicy;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(i64);

    impl LogEntry for Entry {
        fn logged_at_ms(&self) -> i64 {
            self.0
        }
    }

    struct Exploding;

    impl Sweepable for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn sweep(&self, _now_ms: i64) -> usize {
            panic!("sweep blew up");
        }
    }

    #[test]
    fn removes_entries_before_cutoff() {
        let mut entries: VecDeque<Entry> = [2000, 4000, 7000].into_iter().map(Entry).collect();
        assert_eq!(remove_expired(&mut entries, 10_000, 5000), 2);
        assert_eq!(entries, VecDeque::from(vec![Entry(7000)]));
        assert_eq!(remove_expired(&mut entries, 10_000, 5000), 0);
    }

    #[test]
    fn entry_exactly_at_cutoff_survives() {
        let mut entries: VecDeque<Entry> = VecDeque::from(vec![Entry(5000)]);
        assert_eq!(remove_expired(&mut entries, 10_000, 5000), 0);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn sweep_all_survives_a_panicking_stream() {
        let stream = Arc::new(LogStream::new(
            "jobs",
            RetentionPolicy::time_bounded(Duration::from_millis(5000)),
        ));
        for ts in [2000, 4000, 7000] {
            stream.append(Entry(ts));
        }
        let exploding: Arc<dyn Sweepable> = Arc::new(Exploding);
        let timed: Arc<dyn Sweepable> = stream.clone();
        let streams = vec![exploding, timed];
        assert_eq!(sweep_all(&streams, 10_000), 2);
        assert_eq!(stream.snapshot(), vec![Entry(7000)]);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = ExpirySweeper::spawn(Vec::new(), Duration::ZERO);
        assert!(matches!(result, Err(Error::Runtime(_))));
    }

    #[test]
    fn thread_keeps_ticking_and_stops_on_shutdown() {
        let exploding: Arc<dyn Sweepable> = Arc::new(Exploding);
        let streams = vec![exploding];
        let handle = ExpirySweeper::spawn(streams, Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.ticks() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.ticks() >= 3);
        handle.shutdown();
    }

    #[test]
    fn sweeps_aged_records_in_background() {
        let stream = Arc::new(LogStream::new(
            "operations",
            RetentionPolicy::time_bounded(Duration::from_millis(1000)),
        ));
        stream.append(Entry(epoch_ms() - 60_000));
        stream.append(Entry(epoch_ms() + 60_000));

        let timed: Arc<dyn Sweepable> = stream.clone();
        let streams = vec![timed];
        let handle = ExpirySweeper::spawn(streams, Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stream.len() > 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(handle);
        assert_eq!(stream.len(), 1);
    }
}
