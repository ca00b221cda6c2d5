//! Direct write access to a connection's stdin
//!
//! [`Connection::write_lines`](crate::Connection::write_lines) covers the
//! common case; a [`StdinWriter`] hands out the raw pipe as a
//! `std::io::Write` for consumers that need to control writes and flushes
//! themselves (feeding a heredoc, streaming file contents into `cat > f`).

use std::io::Write;
use std::sync::Arc;

use crate::connection::Inner;

/// `std::io::Write` adapter over a connection's stdin pipe
///
/// Shares the connection's internal write lock, so interleaving with
/// `write_lines` from other threads stays at whole-call granularity.
/// Dropping the writer does not close the pipe.
pub struct StdinWriter {
    inner: Arc<Inner>,
}

impl StdinWriter {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

impl Write for StdinWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.stdin_write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.stdin_flush()
    }
}
