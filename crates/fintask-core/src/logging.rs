use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::LoggingLevel;

impl LoggingLevel {
    fn as_filter_directive(self) -> &'static str {
        match self {
            LoggingLevel::Debug => "debug",
            LoggingLevel::Info => "info",
            LoggingLevel::Warning => "warn",
            LoggingLevel::Error => "error",
        }
    }
}

/// Initializes structured logging to `file`, rotating by rename once the
/// active file exceeds `max_bytes`.
///
/// `tracing_appender::rolling` only offers calendar-period rotation
/// (minutely/hourly/daily/never), and the spec's threshold is a byte count,
/// so the active file is wrapped in [`SizeRotatingFile`], which checks its
/// own size on every write and rotates via [`rotate_log_file`] before it
/// would exceed `max_bytes`. The non-blocking writer still runs the actual
/// write on its own background thread; only that thread ever touches the
/// wrapped file, so no locking is needed beyond what `tracing_appender`
/// already provides.
pub fn init_logging(
    log_dir: impl AsRef<Path>,
    file_name: impl AsRef<str>,
    level: LoggingLevel,
    max_bytes: u64,
) -> anyhow::Result<WorkerGuard> {
    let path = log_dir.as_ref().join(file_name.as_ref());
    std::fs::create_dir_all(log_dir.as_ref())?;
    let writer = SizeRotatingFile::open(path, max_bytes)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let filter = EnvFilter::try_new(level.as_filter_directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}

/// Renames `path` with a `.<unix_timestamp>` suffix. Compression of the
/// rotated file is left to the operator.
pub fn rotate_log_file(path: impl AsRef<Path>, now_unix: i64) -> std::io::Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    let rotated = path.with_extension(format!("{now_unix}.log"));
    std::fs::rename(path, rotated)
}

/// A [`Write`] implementation that renames the active log file once it
/// crosses `max_bytes` and reopens a fresh one in its place, the write-time
/// counterpart to the standalone [`rotate_log_file`] helper. `max_bytes ==
/// 0` disables rotation entirely (useful for tests).
struct SizeRotatingFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl SizeRotatingFile {
    fn open(path: PathBuf, max_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        rotate_log_file(&self.path, chrono::Utc::now().timestamp())?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written >= self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_is_noop_when_file_missing() {
        let result = rotate_log_file("/tmp/fintask-test-nonexistent-log-file.log", 12345);
        assert!(result.is_ok());
    }

    #[test]
    fn rotate_renames_existing_file() {
        let dir = std::env::temp_dir().join(format!("fintask-log-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("worker.log");
        std::fs::write(&path, b"hello").unwrap();

        rotate_log_file(&path, 999).unwrap();

        assert!(!path.exists());
        assert!(dir.join("worker.999.log").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn size_rotating_file_rotates_once_threshold_crossed() {
        let dir = std::env::temp_dir().join(format!("fintask-rotate-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("worker.log");

        let mut writer = SizeRotatingFile::open(path.clone(), 10).unwrap();
        writer.write_all(b"12345").unwrap();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        writer.write_all(b"67890").unwrap();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        // Written length is now >= max_bytes, so the next write rotates first.
        writer.write_all(b"x").unwrap();
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 2, "expected the old file to be renamed aside");
        assert!(std::fs::read_to_string(&path).unwrap() == "x");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn size_rotating_file_never_rotates_when_max_bytes_is_zero() {
        let dir = std::env::temp_dir().join(format!("fintask-rotate-off-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("worker.log");

        let mut writer = SizeRotatingFile::open(path, 0).unwrap();
        for _ in 0..5 {
            writer.write_all(b"0123456789").unwrap();
        }
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
