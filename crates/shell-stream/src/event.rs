//! Raw connection events and listener interfaces
//!
//! Every line read from the shell's stdout, plus the connect/disconnect
//! edges, travels from the reader thread to the dispatch thread as a
//! [`StreamEvent`]. Listeners never see the queue itself; they are invoked
//! from the dispatch thread, one event at a time, in arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw event from a shell connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The kind of event
    pub kind: StreamEventKind,
}

impl StreamEvent {
    /// Create a new event of the given kind, stamped with the current time
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Create a new output-line event
    pub fn line(line: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Line(line.into()))
    }
}

/// Kinds of raw connection events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamEventKind {
    /// The shell process has been spawned and its reader is running
    Connected,
    /// The shell process has exited and the connection was torn down
    Disconnected,
    /// One line of output from the shell's stdout
    Line(String),
}

/// Token identifying a registered listener, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Receives every output line of a connection
///
/// Implemented for plain closures, so `conn.add_stream_listener(|line| ...)`
/// works without a named type. Callbacks run on the connection's dispatch
/// thread; a slow callback delays later callbacks on the same connection but
/// never the reader itself.
pub trait StreamListener: Send + Sync {
    /// Called for every line the shell writes to stdout, in arrival order
    fn on_line(&self, line: &str);
}

impl<F> StreamListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_line(&self, line: &str) {
        self(line)
    }
}

/// Tracks the connect/disconnect lifecycle of a connection
///
/// Both methods have empty default bodies so an implementation can observe
/// only the edge it cares about.
pub trait ConnectionListener: Send + Sync {
    /// Called once the connection is established and the reader is running
    fn on_connect(&self) {}

    /// Called after the shell process exited and teardown completed
    fn on_disconnect(&self) {}
}
