use std::fmt::Arguments;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// The operator-facing event log.
///
/// Low volume, append-only, one human-readable line per event. Consumed by
/// people diagnosing why something was or was not skipped, never by the
/// engine itself. Handles are cheap to clone and share a writer.
#[derive(Clone)]
pub struct Logger {
    sink: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl Logger {
    /// Log to an arbitrary writer.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { sink: Some(Arc::new(Mutex::new(writer))) }
    }

    /// Append to a log file, creating it if needed.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file: File =
            OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// Discard all events.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Write one event line. Log failures are swallowed; the log is an
    /// observability surface, not a dependency.
    pub fn event(&self, args: Arguments) {
        if let Some(sink) = &self.sink {
            let mut writer = sink.lock();
            let _ = writeln!(writer, "{args}");
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(if self.sink.is_some() { "Logger(..)" } else { "Logger(off)" })
    }
}

/// Formats and writes one operator log event.
macro_rules! user_log {
    ($logger:expr, $($arg:tt)*) => {
        $logger.event(format_args!($($arg)*))
    };
}

pub(crate) use user_log;
