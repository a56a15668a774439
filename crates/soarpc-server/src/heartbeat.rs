//! The worker liveness file.

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Writes are throttled to avoid dragging down request throughput with
/// file-system traffic.
const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(2500);

/// A liveness file updated after every request and idle period.
///
/// The path template may contain `{pid}` and `{fid}` (fork index)
/// placeholders; the content is the ASCII decimal epoch of the last
/// update. The file is created on start and removed on clean exit.
pub struct HeartbeatFile {
    path: PathBuf,
    file: std::fs::File,
    last_update: Option<Instant>,
}

impl HeartbeatFile {
    pub fn create(
        template: &str,
        forked_process_id: Option<u32>,
    ) -> std::io::Result<Self> {
        let mut path = template.replace("{pid}", &std::process::id().to_string());
        if let Some(fid) = forked_process_id {
            path = path.replace("{fid}", &fid.to_string());
        }
        let path = PathBuf::from(path);
        tracing::info!(path = %path.display(), "creating heartbeat file");
        let file = std::fs::File::create(&path)?;
        let mut heartbeat = Self { path, file, last_update: None };
        heartbeat.write_now()?;
        Ok(heartbeat)
    }

    /// Refreshes the heartbeat if enough time has passed since the last
    /// write.
    pub fn update(&mut self) {
        let due = self
            .last_update
            .map_or(true, |last| last.elapsed() >= MIN_WRITE_INTERVAL);
        if due {
            if let Err(err) = self.write_now() {
                tracing::warn!(error = %err, "could not update heartbeat file");
            }
        }
    }

    fn write_now(&mut self) -> std::io::Result<()> {
        let epoch =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(epoch.to_string().as_bytes())?;
        self.file.flush()?;
        self.last_update = Some(Instant::now());
        Ok(())
    }

    /// Removes the heartbeat file on clean shutdown.
    pub fn delete(self) {
        tracing::info!(path = %self.path.display(), "removing heartbeat file");
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(error = %err, "could not remove heartbeat file");
        }
    }
}
