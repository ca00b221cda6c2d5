//! Tests for the connection lifecycle and listener fan-out

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shell_stream::{Connection, ConnectionListener, ConnectionState};

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[test]
fn connect_and_disconnect() {
    let conn = Connection::new();
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    assert!(conn.connect(false, true));
    assert!(conn.is_connected());
    assert!(!conn.is_privileged());
    assert_eq!(conn.state(), ConnectionState::Connected);

    // connecting an already-connected instance is a no-op
    assert!(conn.connect(false, true));

    conn.disconnect();
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn destroy_is_idempotent() {
    let conn = Connection::new();
    assert!(conn.connect(false, true));

    conn.destroy();
    conn.destroy();
    assert!(!conn.is_connected());

    // destroying a never-connected instance is fine too
    Connection::new().destroy();
}

#[test]
fn connection_ids_are_unique() {
    let a = Connection::new();
    let b = Connection::new();
    assert_ne!(a.id(), b.id());
}

#[test]
fn write_fails_when_not_connected() {
    let conn = Connection::new();
    assert!(!conn.write_lines(&["echo nope"]));
    assert!(!conn.write("raw"));
}

#[test]
fn lines_reach_stream_listeners_in_order() {
    let conn = Connection::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        conn.add_stream_listener(move |line: &str| seen.lock().unwrap().push(line.to_string()));
    }

    assert!(conn.connect(false, true));
    assert!(conn.write_lines(&["echo first", "echo second"]));

    assert!(wait_until(Duration::from_secs(5), || {
        seen.lock().unwrap().iter().any(|l| l == "second")
    }));

    let lines = seen.lock().unwrap();
    let first = lines.iter().position(|l| l == "first").unwrap();
    let second = lines.iter().position(|l| l == "second").unwrap();
    assert!(first < second);

    drop(lines);
    conn.destroy();
}

#[test]
fn blocking_connect_dispatches_the_connect_event_first() {
    struct Edges {
        connected: Arc<AtomicBool>,
        disconnected: Arc<AtomicBool>,
    }

    impl ConnectionListener for Edges {
        fn on_connect(&self) {
            self.connected.store(true, Ordering::SeqCst);
        }

        fn on_disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    let conn = Connection::new();
    let connected = Arc::new(AtomicBool::new(false));
    let disconnected = Arc::new(AtomicBool::new(false));
    conn.add_connection_listener(Edges {
        connected: Arc::clone(&connected),
        disconnected: Arc::clone(&disconnected),
    });

    // block_until_ready guarantees the listener round ran before we return
    assert!(conn.connect(false, true));
    assert!(connected.load(Ordering::SeqCst));
    assert!(!disconnected.load(Ordering::SeqCst));

    conn.disconnect();
    assert!(disconnected.load(Ordering::SeqCst));
}

#[test]
fn removed_listener_stops_receiving() {
    let conn = Connection::new();
    let count = Arc::new(AtomicUsize::new(0));

    let id = {
        let count = Arc::clone(&count);
        conn.add_stream_listener(move |_: &str| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    assert!(conn.connect(false, true));
    assert!(conn.write_lines(&["echo one"]));
    assert!(wait_until(Duration::from_secs(5), || {
        count.load(Ordering::SeqCst) > 0
    }));

    assert!(conn.remove_stream_listener(id));
    assert!(!conn.remove_stream_listener(id));
    let snapshot = count.load(Ordering::SeqCst);

    // a second listener acts as a fence: once it saw the new line, the
    // removed listener would have been called too if it were still there
    let fence = Arc::new(AtomicBool::new(false));
    {
        let fence = Arc::clone(&fence);
        conn.add_stream_listener(move |line: &str| {
            if line == "two" {
                fence.store(true, Ordering::SeqCst);
            }
        });
    }

    assert!(conn.write_lines(&["echo two"]));
    assert!(wait_until(Duration::from_secs(5), || fence.load(Ordering::SeqCst)));
    assert_eq!(count.load(Ordering::SeqCst), snapshot);

    conn.destroy();
}

#[test]
fn merged_stderr_reaches_listeners() {
    let conn = Connection::new();
    let seen = Arc::new(AtomicBool::new(false));

    {
        let seen = Arc::clone(&seen);
        conn.add_stream_listener(move |line: &str| {
            if line.contains("err-visible") {
                seen.store(true, Ordering::SeqCst);
            }
        });
    }

    assert!(conn.connect(false, true));
    assert!(conn.write_lines(&["echo err-visible >&2"]));
    assert!(wait_until(Duration::from_secs(5), || seen.load(Ordering::SeqCst)));

    conn.destroy();
}

#[test]
fn discarded_stderr_never_reaches_listeners() {
    let conn = Connection::new();
    let err_seen = Arc::new(AtomicBool::new(false));
    let fence = Arc::new(AtomicBool::new(false));

    {
        let err_seen = Arc::clone(&err_seen);
        let fence = Arc::clone(&fence);
        conn.add_stream_listener(move |line: &str| {
            if line.contains("err-hidden") {
                err_seen.store(true, Ordering::SeqCst);
            }
            if line == "fence" {
                fence.store(true, Ordering::SeqCst);
            }
        });
    }

    assert!(conn.connect_with(false, true, true));
    assert!(conn.write_lines(&["echo err-hidden >&2", "echo fence"]));
    assert!(wait_until(Duration::from_secs(5), || fence.load(Ordering::SeqCst)));
    assert!(!err_seen.load(Ordering::SeqCst));

    conn.destroy();
}

#[test]
fn stdin_writer_feeds_the_process() {
    use std::io::Write;

    let conn = Connection::new();
    let seen = Arc::new(AtomicBool::new(false));

    {
        let seen = Arc::clone(&seen);
        conn.add_stream_listener(move |line: &str| {
            if line == "via-writer" {
                seen.store(true, Ordering::SeqCst);
            }
        });
    }

    assert!(conn.connect(false, true));

    let mut writer = conn.writer();
    writer.write_all(b"echo via-writer\n").unwrap();
    writer.flush().unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.load(Ordering::SeqCst)));
    conn.destroy();
}

#[test]
fn abnormal_exit_dispatches_disconnect() {
    let conn = Connection::new();
    let disconnected = Arc::new(AtomicBool::new(false));

    struct Watch(Arc<AtomicBool>);
    impl ConnectionListener for Watch {
        fn on_disconnect(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }
    conn.add_connection_listener(Watch(Arc::clone(&disconnected)));

    assert!(conn.connect(false, true));
    // the shell exits on its own; nobody called disconnect()
    assert!(conn.write_lines(&["exit 7"]));

    assert!(wait_until(Duration::from_secs(5), || {
        disconnected.load(Ordering::SeqCst)
    }));
    assert!(!conn.is_connected());
}
