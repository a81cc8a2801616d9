//! Assern, an MCP aggregation gateway.
//!
//! Starts many backend MCP servers, discovers their tools, resources and
//! prompts, and exposes them as one collision-free capability surface.
//!
//! - `backend` talks MCP to a single server over stdio, HTTP or SSE.
//! - `gateway` namespaces, tracks health, retries and dispatches.
//! - `config` loads the YAML file describing the backends.

pub mod backend;
pub mod config;
pub mod gateway;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::EnvFilter;

pub use config::{
    BackendDescriptor, GatewayConfig, GatewaySettings, LogFormat, LoggingConfig, RetryConfig,
};
pub use gateway::{Aggregator, GatewayError, StartupReport};

/// Initialize the tracing subscriber from the `logging` config section.
///
/// Logs go to stderr unless a file is configured, since stdout may carry
/// protocol traffic. A log file is rotated first (`assern.log` becomes
/// `assern.log.1` and so on, `keep` generations deep) and then written
/// through a line-flushing writer.
///
/// The filter comes from `RUST_LOG`, defaulting to `assern=info,warn`.
pub fn init_tracing(logging: &LoggingConfig) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("assern=info,warn"));

    let Some(path) = logging.file.as_deref() else {
        install_subscriber(filter, logging.format, io::stderr, true);
        return Ok(());
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    rotate_logs(path, logging.keep)?;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    install_subscriber(filter, logging.format, FlushingWriter::new(file), false);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %path.display(),
        keep = logging.keep,
        pid = std::process::id(),
        "=== assern starting ==="
    );
    Ok(())
}

fn install_subscriber<W>(filter: EnvFilter, format: LogFormat, writer: W, ansi: bool)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

/// `base` with a generation suffix: `assern.log` and 2 give `assern.log.2`.
fn log_generation(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift every existing generation up by one, dropping what falls past
/// `keep`. With `keep == 0` the previous log is simply discarded.
fn rotate_logs(base: &Path, keep: u32) -> io::Result<()> {
    if keep == 0 {
        return ignore_missing(std::fs::remove_file(base));
    }

    ignore_missing(std::fs::remove_file(log_generation(base, keep)))?;
    for generation in (1..keep).rev() {
        ignore_missing(std::fs::rename(
            log_generation(base, generation),
            log_generation(base, generation + 1),
        ))?;
    }
    ignore_missing(std::fs::rename(base, log_generation(base, 1)))
}

/// Gaps in the generation chain are normal.
fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Flushes after every write so each log line reaches disk immediately.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: impl AsRef<Path>) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("assern.log");

        std::fs::write(&base, "current").unwrap();
        std::fs::write(log_generation(&base, 1), "one").unwrap();
        std::fs::write(log_generation(&base, 3), "three").unwrap();

        rotate_logs(&base, 3).unwrap();

        assert!(!base.exists());
        assert_eq!(read(log_generation(&base, 1)), "current");
        assert_eq!(read(log_generation(&base, 2)), "one");
        assert!(!log_generation(&base, 3).exists(), "gap in the chain leaves .3 empty");
    }

    #[test]
    fn test_rotate_honours_configured_depth() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("assern.log");

        for run in ["first", "second", "third"] {
            rotate_logs(&base, 1).unwrap();
            std::fs::write(&base, run).unwrap();
        }

        assert_eq!(read(&base), "third");
        assert_eq!(read(log_generation(&base, 1)), "second");
        assert!(!log_generation(&base, 2).exists());
    }

    #[test]
    fn test_rotate_with_zero_keep_discards_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("assern.log");
        std::fs::write(&base, "old").unwrap();

        rotate_logs(&base, 0).unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rotate_without_existing_logs_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("assern.log");
        rotate_logs(&base, 3).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_log_generation_appends_suffix() {
        let base = Path::new("/tmp/logs/assern.log");
        assert_eq!(log_generation(base, 2), PathBuf::from("/tmp/logs/assern.log.2"));
    }

    #[test]
    fn test_flushing_writer_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assern.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        let mut clone = writer.clone();
        writer.write_all(b"first\n").unwrap();
        clone.write_all(b"second\n").unwrap();

        assert_eq!(read(&path), "first\nsecond\n");
    }
}
