//! Pull-based access to a connection's output
//!
//! The connection's reader thread normally fans lines out to listeners and
//! discards the raw bytes. A [`ConnectionReader`] flips that: while one is
//! open, every raw chunk the reader thread pulls off the pipe is held back
//! until a `read()` call claims it, so a blocking consumer sees the exact
//! byte stream without anything being dropped behind its back.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};

/// Handshake state shared between the reader thread and open readers
#[derive(Default)]
struct BridgeState {
    /// Nested open count; the bridge is active while above zero
    openers: usize,
    /// Mirrors the connection's liveness
    connected: bool,
    /// A `read()` call is parked waiting for the next chunk
    want: bool,
    /// The chunk currently being consumed
    chunk: Vec<u8>,
    pos: usize,
    /// Reader-side hint that the pipe had more data after this chunk
    more: bool,
}

impl BridgeState {
    fn active(&self) -> bool {
        self.openers > 0 && self.connected
    }

    fn buffered(&self) -> bool {
        self.pos < self.chunk.len()
    }
}

/// Rendezvous point between the reader thread and pull-style consumers
///
/// Owned by the connection; one per connection for its whole lifetime.
pub(crate) struct Bridge {
    state: Mutex<BridgeState>,
    cond: Condvar,
}

impl Bridge {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState::default()),
            cond: Condvar::new(),
        }
    }

    /// Whether any reader is open on a live connection
    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().unwrap().active()
    }

    /// Track connection liveness; a drop wakes both sides
    pub(crate) fn set_connected(&self, connected: bool) {
        let mut st = self.state.lock().unwrap();
        st.connected = connected;
        self.cond.notify_all();
    }

    /// Hand one raw chunk over to a waiting `read()` call
    ///
    /// Called by the reader thread after each chunk has been fed to the
    /// listener path. Blocks until a `read()` requests data (back-pressure:
    /// no further chunk is pulled off the pipe until this one is claimed),
    /// or returns without delivering when the bridge goes inactive.
    pub(crate) fn offer(&self, data: &[u8], more: bool) {
        let mut st = self.state.lock().unwrap();
        loop {
            if !st.active() {
                return;
            }

            if st.want {
                st.chunk.clear();
                st.chunk.extend_from_slice(data);
                st.pos = 0;
                st.more = more;
                st.want = false;
                self.cond.notify_all();
                return;
            }

            st = self.cond.wait(st).unwrap();
        }
    }

    fn open(&self) {
        self.state.lock().unwrap().openers += 1;
    }

    fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.openers = st.openers.saturating_sub(1);
        if st.openers == 0 {
            st.chunk.clear();
            st.pos = 0;
            st.want = false;
        }
        // wake a reader thread parked in offer()
        self.cond.notify_all();
    }

    fn read_into(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut st = self.state.lock().unwrap();
        loop {
            if st.buffered() {
                let n = buf.len().min(st.chunk.len() - st.pos);
                buf[..n].copy_from_slice(&st.chunk[st.pos..st.pos + n]);
                st.pos += n;
                return Ok(n);
            }

            if !st.connected {
                return Ok(0);
            }

            st.want = true;
            self.cond.notify_all();
            st = self.cond.wait(st).unwrap();
        }
    }

    fn ready(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.buffered() || (st.more && st.connected)
    }
}

/// Blocking byte reader over a connection's output
///
/// Obtained from [`Connection::reader`](crate::Connection::reader). Listener
/// delivery continues unchanged while a reader is open, but the reader
/// thread only advances chunk by chunk as `read()` calls drain it.
///
/// Cloning shares the same byte stream: concurrent handles race for the
/// incoming chunks rather than each seeing a copy. Dropping the last handle
/// releases the connection back into free-running mode.
pub struct ConnectionReader {
    bridge: Arc<Bridge>,
}

impl ConnectionReader {
    pub(crate) fn new(bridge: Arc<Bridge>) -> Self {
        bridge.open();
        Self { bridge }
    }

    /// Whether a `read()` would likely return without blocking
    pub fn ready(&self) -> bool {
        self.bridge.ready()
    }
}

impl Read for ConnectionReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.bridge.read_into(buf)
    }
}

impl Clone for ConnectionReader {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.bridge))
    }
}

impl Drop for ConnectionReader {
    fn drop(&mut self) {
        self.bridge.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn offer_discards_when_inactive() {
        let bridge = Bridge::new();
        bridge.set_connected(true);

        // no opener: must return immediately without blocking
        bridge.offer(b"dropped", false);
        assert!(!bridge.is_active());
    }

    #[test]
    fn read_returns_eof_when_disconnected() {
        let bridge = Arc::new(Bridge::new());
        let mut reader = ConnectionReader::new(Arc::clone(&bridge));

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn chunk_handshake_delivers_bytes() {
        let bridge = Arc::new(Bridge::new());
        bridge.set_connected(true);
        let mut reader = ConnectionReader::new(Arc::clone(&bridge));

        let producer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                bridge.offer(b"hello", false);
                bridge.set_connected(false);
            })
        };

        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        let mut rest = [0u8; 8];
        assert_eq!(reader.read(&mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], b"lo");

        producer.join().unwrap();
        assert_eq!(reader.read(&mut rest).unwrap(), 0);
    }

    #[test]
    fn close_releases_parked_offer() {
        let bridge = Arc::new(Bridge::new());
        bridge.set_connected(true);
        let reader = ConnectionReader::new(Arc::clone(&bridge));

        let producer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.offer(b"never claimed", false))
        };

        thread::sleep(Duration::from_millis(50));
        drop(reader);

        producer.join().unwrap();
    }
}
