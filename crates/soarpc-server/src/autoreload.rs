//! Auto-reload: watch code paths and shut down gracefully on any change
//! so the supervisor respawns the worker with the new build.

use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Spawns a watcher thread over `paths`. On the first (debounced) change
/// it sets `reload_requested` and then `shutting_down`, which ends the
/// server's run loop; the run outcome tells the supervisor to respawn.
pub fn spawn_file_watcher(
    paths: Vec<PathBuf>,
    debounce: Duration,
    shutting_down: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>, notify::Error> {
    let (sender, receiver) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(debounce, sender)?;
    for path in &paths {
        debouncer.watcher().watch(path, RecursiveMode::Recursive)?;
        tracing::info!(path = %path.display(), "watching for changes");
    }

    Ok(std::thread::spawn(move || {
        // The debouncer must stay alive for events to flow.
        let _debouncer = debouncer;
        loop {
            if shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(Ok(events)) if !events.is_empty() => {
                    tracing::info!(
                        changed = %events[0].path.display(),
                        "source change detected, triggering reload"
                    );
                    reload_requested.store(true, Ordering::SeqCst);
                    shutting_down.store(true, Ordering::SeqCst);
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "file watcher error");
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_triggers_reload() {
        let dir = std::env::temp_dir().join(format!("soarpc-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let shutting_down = Arc::new(AtomicBool::new(false));
        let reload_requested = Arc::new(AtomicBool::new(false));
        let watcher = spawn_file_watcher(
            vec![dir.clone()],
            Duration::from_millis(50),
            shutting_down.clone(),
            reload_requested.clone(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(dir.join("changed.rs"), b"fn main() {}").unwrap();

        watcher.join().unwrap();
        assert!(reload_requested.load(Ordering::SeqCst));
        assert!(shutting_down.load(Ordering::SeqCst));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_shutdown_stops_the_watcher() {
        let dir = std::env::temp_dir().join(format!("soarpc-watch2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let shutting_down = Arc::new(AtomicBool::new(false));
        let reload_requested = Arc::new(AtomicBool::new(false));
        let watcher = spawn_file_watcher(
            vec![dir.clone()],
            Duration::from_millis(50),
            shutting_down.clone(),
            reload_requested.clone(),
        )
        .unwrap();

        shutting_down.store(true, Ordering::SeqCst);
        watcher.join().unwrap();
        assert!(!reload_requested.load(Ordering::SeqCst));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
