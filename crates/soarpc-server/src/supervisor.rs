//! Multi-worker supervision.
//!
//! The supervisor spawns `N` worker processes by re-executing the current
//! binary with a fork-index environment variable set (Rust offers no safe
//! bare `fork()`), monitors each one, and respawns workers that exit
//! abnormally within a crash budget: at most 3 crashes in any 15-second
//! window or 8 in any 60-second window per worker. Exceeding the budget
//! tears the whole group down. SIGTERM/SIGINT are forwarded to every
//! worker, with SIGKILL escalation after the shutdown grace.

use crate::harakiri::EXIT_CODE_HARAKIRI;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::{HashMap, VecDeque};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Environment variable carrying a worker's fork index (1-based). Its
/// presence tells a process it is a worker, not the supervisor.
pub const FORK_ID_ENV: &str = "SOARPC_FORK_ID";

/// Exit code a worker uses to request a respawn after a code change. Not
/// counted against the crash budget.
pub const EXIT_CODE_RELOAD: i32 = 76;

const FIFTEEN_SECOND_CRASH_LIMIT: usize = 3;
const SIXTY_SECOND_CRASH_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Number of worker processes to run.
    pub fork_count: u32,
    /// Respawn crashed workers (subject to the crash budget).
    pub respawn: bool,
    /// How long to wait for graceful worker exit before SIGKILL.
    pub shutdown_grace: Duration,
}

/// The fork index assigned to this process by a supervisor, if any.
pub fn forked_process_id() -> Option<u32> {
    std::env::var(FORK_ID_ENV).ok().and_then(|value| value.parse().ok())
}

fn terminate_all(children: &Mutex<HashMap<u32, u32>>, signal: Signal) {
    for (&index, &pid) in children.lock().iter() {
        tracing::info!(worker = index, pid, signal = %signal, "signalling worker");
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}

struct CrashBudget {
    recent: VecDeque<Instant>,
    window: Duration,
    limit: usize,
}

impl CrashBudget {
    fn new(limit: usize, window: Duration) -> Self {
        Self { recent: VecDeque::with_capacity(limit), window, limit }
    }

    /// Records a crash; returns false when the budget is exhausted.
    fn record(&mut self, at: Instant) -> bool {
        if self.recent.len() == self.limit {
            if at.duration_since(self.recent[0]) < self.window {
                return false;
            }
            self.recent.pop_front();
        }
        self.recent.push_back(at);
        true
    }
}

fn spawn_worker(index: u32) -> std::io::Result<std::process::Child> {
    let exe = std::env::current_exe()?;
    Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(FORK_ID_ENV, index.to_string())
        .spawn()
}

fn monitor_worker(
    index: u32,
    respawn: bool,
    shutdown: Arc<AtomicBool>,
    budget_exceeded: Arc<AtomicBool>,
    children: Arc<Mutex<HashMap<u32, u32>>>,
) {
    let mut fifteen_second_budget =
        CrashBudget::new(FIFTEEN_SECOND_CRASH_LIMIT, Duration::from_secs(15));
    let mut sixty_second_budget =
        CrashBudget::new(SIXTY_SECOND_CRASH_LIMIT, Duration::from_secs(60));

    loop {
        let mut child = match spawn_worker(index) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(worker = index, error = %err, "could not spawn worker");
                budget_exceeded.store(true, Ordering::SeqCst);
                shutdown.store(true, Ordering::SeqCst);
                return;
            }
        };
        children.lock().insert(index, child.id());
        let status = child.wait();
        children.lock().remove(&index);

        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let code = status.ok().and_then(|status| status.code());
        match code {
            Some(0) => return,
            Some(EXIT_CODE_RELOAD) => {
                tracing::info!(worker = index, "worker requested reload, respawning");
                continue;
            }
            Some(EXIT_CODE_HARAKIRI) => {
                tracing::warn!(worker = index, "worker terminated by harakiri");
            }
            other => {
                tracing::warn!(worker = index, exit_code = other, "worker exited abnormally");
            }
        }
        if !respawn {
            return;
        }

        let now = Instant::now();
        if !fifteen_second_budget.record(now) {
            tracing::error!(
                worker = index,
                "worker crashed {} times in 15 seconds, not respawning",
                FIFTEEN_SECOND_CRASH_LIMIT
            );
            budget_exceeded.store(true, Ordering::SeqCst);
            shutdown.store(true, Ordering::SeqCst);
            terminate_all(&children, Signal::SIGTERM);
            return;
        }
        if !sixty_second_budget.record(now) {
            tracing::error!(
                worker = index,
                "worker crashed {} times in 60 seconds, not respawning",
                SIXTY_SECOND_CRASH_LIMIT
            );
            budget_exceeded.store(true, Ordering::SeqCst);
            shutdown.store(true, Ordering::SeqCst);
            terminate_all(&children, Signal::SIGTERM);
            return;
        }
        tracing::info!(worker = index, "respawning failed worker");
    }
}

/// Runs the supervisor: spawns the workers, forwards signals, respawns
/// within the crash budget, and returns the process exit code.
///
/// `pre_fork` runs exactly once, before any worker is spawned, and never
/// again even when workers are respawned.
pub fn run_supervisor(options: SupervisorOptions, pre_fork: impl FnOnce()) -> i32 {
    let mut fork_count = options.fork_count.max(1);
    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
    let max_forks = cpu_count * 5;
    if fork_count > max_forks {
        tracing::warn!(
            requested = fork_count,
            cpu_count,
            cap = max_forks,
            "requested fork count exceeds five times the CPU count, capping"
        );
        fork_count = max_forks;
    }

    pre_fork();

    let shutdown = Arc::new(AtomicBool::new(false));
    let budget_exceeded = Arc::new(AtomicBool::new(false));
    let children: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    {
        // Forward shutdown signals to every worker; a second signal (or
        // the grace expiring) escalates to SIGKILL.
        let shutdown = shutdown.clone();
        let children = children.clone();
        let grace = options.shutdown_grace;
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(err) => {
                tracing::error!(error = %err, "could not install signal handlers");
                return 1;
            }
        };
        std::thread::spawn(move || {
            let mut already_signalled = false;
            for _signal in signals.forever() {
                if already_signalled {
                    tracing::warn!("received second interrupt, killing workers");
                    terminate_all(&children, Signal::SIGKILL);
                    break;
                }
                tracing::info!("received interrupt, shutting down workers");
                already_signalled = true;
                shutdown.store(true, Ordering::SeqCst);
                terminate_all(&children, Signal::SIGTERM);

                let children = children.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(grace);
                    terminate_all(&children, Signal::SIGKILL);
                });
            }
        });
    }

    let monitors: Vec<_> = (1..=fork_count)
        .map(|index| {
            let shutdown = shutdown.clone();
            let budget_exceeded = budget_exceeded.clone();
            let children = children.clone();
            std::thread::spawn(move || {
                monitor_worker(index, options.respawn, shutdown, budget_exceeded, children)
            })
        })
        .collect();
    for monitor in monitors {
        let _ = monitor.join();
    }

    if budget_exceeded.load(Ordering::SeqCst) {
        1
    } else {
        0
    }
}
