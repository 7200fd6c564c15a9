//! Periodic timer thread
//!
//! Storage maintenance (flush pacing, idle eviction, quota changes, proxy
//! sweeps) must run on the executor thread, so the timer itself does no
//! work: every period it calls a tick callback that flags the executor and
//! wakes it. The thread sleeps in short steps so shutdown is prompt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{RawDbError, RawResult};

/// Longest single sleep, bounding shutdown latency.
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Handle to the running timer thread.
/// Dropping it stops the thread.
pub struct TimerHandle {
    shutdown: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TimerHandle {
    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Ticks delivered since start.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a thread calling `tick` every `period`.
pub fn start_timer<F>(period: Duration, tick: F) -> RawResult<TimerHandle>
where
    F: Fn() + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicU64::new(0));
    let thread_shutdown = Arc::clone(&shutdown);
    let thread_ticks = Arc::clone(&ticks);

    let thread = thread::Builder::new()
        .name("rawdb-timer".to_string())
        .spawn(move || timer_loop(period, tick, &thread_shutdown, &thread_ticks))
        .map_err(|e| RawDbError::Io {
            path: None,
            kind: e.kind(),
            message: format!("failed to spawn timer thread: {}", e),
        })?;

    Ok(TimerHandle { shutdown, ticks, thread: Some(thread) })
}

fn timer_loop<F: Fn()>(period: Duration, tick: F, shutdown: &AtomicBool, ticks: &AtomicU64) {
    tracing::debug!(period_ms = period.as_millis() as u64, "timer started");
    loop {
        let wake_time = Instant::now() + period;
        loop {
            if shutdown.load(Ordering::Acquire) {
                tracing::debug!("timer stopped");
                return;
            }
            let now = Instant::now();
            if now >= wake_time {
                break;
            }
            thread::sleep((wake_time - now).min(SLEEP_STEP));
        }
        tick();
        ticks.fetch_add(1, Ordering::Relaxed);
    }
}
