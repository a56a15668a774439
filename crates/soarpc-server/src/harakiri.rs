//! The per-request watchdog.
//!
//! A worker processes one request at a time, so a single stuck request
//! stalls the whole worker. The watchdog thread observes when request
//! processing began; once a request has been running longer than the
//! configured timeout it initiates a graceful shutdown, and if the request
//! still has not finished after the shutdown grace it terminates the
//! process with a distinct exit code so the supervisor respawns the
//! worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exit code of a worker terminated by the watchdog (`EX_TEMPFAIL`).
pub const EXIT_CODE_HARAKIRI: i32 = 75;

const TICK: Duration = Duration::from_millis(100);

struct WatchdogState {
    /// Milliseconds since watchdog start at which the current request
    /// began; 0 when idle.
    busy_since_ms: AtomicU64,
    fired: AtomicBool,
    stop: AtomicBool,
}

/// Handle owned by the server; request begin/end marks drive the watchdog.
pub(crate) struct HarakiriWatchdog {
    state: Arc<WatchdogState>,
    started: Instant,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HarakiriWatchdog {
    /// Starts the watchdog. A zero `timeout` disables it entirely.
    pub fn start(
        timeout: Duration,
        shutdown_grace: Duration,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let state = Arc::new(WatchdogState {
            busy_since_ms: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let started = Instant::now();

        let thread = if timeout.is_zero() {
            None
        } else {
            let state = state.clone();
            Some(std::thread::spawn(move || {
                watch(state, started, timeout, shutdown_grace, shutting_down)
            }))
        };

        Self { state, started, thread }
    }

    pub fn begin_request(&self) {
        let now_ms = self.started.elapsed().as_millis().max(1) as u64;
        self.state.busy_since_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn end_request(&self) {
        self.state.busy_since_ms.store(0, Ordering::SeqCst);
    }

    /// Whether the watchdog has triggered for the current or a previous
    /// request.
    pub fn fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(
    state: Arc<WatchdogState>,
    started: Instant,
    timeout: Duration,
    shutdown_grace: Duration,
    shutting_down: Arc<AtomicBool>,
) {
    let mut fired_for: Option<(u64, Instant)> = None;
    loop {
        std::thread::sleep(TICK);
        if state.stop.load(Ordering::SeqCst) {
            return;
        }

        let busy_since_ms = state.busy_since_ms.load(Ordering::SeqCst);
        if busy_since_ms == 0 {
            fired_for = None;
            continue;
        }
        let busy_for = started.elapsed().saturating_sub(Duration::from_millis(busy_since_ms));

        match fired_for {
            None if busy_for > timeout => {
                tracing::error!(
                    running_for_seconds = busy_for.as_secs(),
                    timeout_seconds = timeout.as_secs(),
                    grace_seconds = shutdown_grace.as_secs(),
                    "request exceeded the harakiri timeout, initiating shutdown"
                );
                state.fired.store(true, Ordering::SeqCst);
                shutting_down.store(true, Ordering::SeqCst);
                fired_for = Some((busy_since_ms, Instant::now()));
            }
            Some((fired_busy_since, fired_at))
                if fired_busy_since == busy_since_ms
                    && fired_at.elapsed() > shutdown_grace =>
            {
                // The stuck request survived the grace period; this worker
                // cannot recover on its own.
                tracing::error!(
                    "graceful shutdown failed after harakiri, terminating worker"
                );
                std::process::exit(EXIT_CODE_HARAKIRI);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_watchdog_never_fires() {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let watchdog = HarakiriWatchdog::start(
            Duration::ZERO,
            Duration::from_secs(1),
            shutting_down.clone(),
        );
        watchdog.begin_request();
        std::thread::sleep(Duration::from_millis(250));
        assert!(!watchdog.fired());
        assert!(!shutting_down.load(Ordering::SeqCst));
        watchdog.stop();
    }

    #[test]
    fn test_overrunning_request_trips_the_watchdog() {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let watchdog = HarakiriWatchdog::start(
            Duration::from_millis(150),
            Duration::from_secs(60), // long grace so the test process survives
            shutting_down.clone(),
        );
        watchdog.begin_request();
        std::thread::sleep(Duration::from_millis(500));
        assert!(watchdog.fired());
        assert!(shutting_down.load(Ordering::SeqCst));
        watchdog.stop();
    }

    #[test]
    fn test_fast_requests_do_not_trip_the_watchdog() {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let watchdog = HarakiriWatchdog::start(
            Duration::from_millis(300),
            Duration::from_secs(60),
            shutting_down.clone(),
        );
        for _ in 0..4 {
            watchdog.begin_request();
            std::thread::sleep(Duration::from_millis(50));
            watchdog.end_request();
        }
        assert!(!watchdog.fired());
        watchdog.stop();
    }
}
