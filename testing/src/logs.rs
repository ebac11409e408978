//! Log capture for tests.
//!
//! [`CapturedLogs`] is a `tracing-subscriber` writer backed by a shared
//! buffer. Installing it as the thread's default subscriber captures every
//! event emitted on that thread, including events from tasks spawned on a
//! current-thread runtime, which is what `#[tokio::test]` uses.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::io;
use std::sync::{Arc, Mutex};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Shared in-memory log sink.
///
/// # Example
///
/// ```
/// use courier_testing::CapturedLogs;
///
/// let logs = CapturedLogs::new();
/// let _guard = logs.install();
///
/// tracing::info!(correlation_id = "req-1", "Handling a message");
///
/// assert!(logs.contents().contains("req-1"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a plain-text fmt subscriber writing into this sink as the
    /// current thread's default, at DEBUG level. Capture stops when the guard
    /// is dropped.
    #[must_use]
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Everything captured so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Captured lines containing `needle`.
    #[must_use]
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

/// Writer handed out by [`CapturedLogs`] for each event.
#[derive(Debug)]
pub struct CapturedWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}
