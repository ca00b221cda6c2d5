//! Shell process connection and its background reader
//!
//! A [`Connection`] owns one shell subprocess and is the sole reader of its
//! stdout. One background thread stays blocked in the pipe read for the life
//! of the process; a second thread delivers listener callbacks so that a
//! slow listener can never stall output drainage. Writers, listeners and
//! pull-style readers all go through this type; nothing else touches the
//! pipes.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as OsCommand, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::event::{ConnectionListener, ListenerId, StreamEvent, StreamEventKind, StreamListener};
use crate::reader::{Bridge, ConnectionReader};
use crate::stdin::StdinWriter;

/// Monotonic source of connection ids, process-wide
static CONNECTIONS: AtomicU32 = AtomicU32::new(0);

/// Fixed read buffer size for the reader thread
const READ_CHUNK: usize = 512;

/// Re-check interval for the connect/disconnect wait gates
const GATE_RECHECK: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Connection`]
///
/// `Connecting` and `Disconnecting` are wait gates: a caller that asked to
/// block sleeps until the dispatch thread has delivered the corresponding
/// lifecycle event and cleared the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No process; the initial and final state
    Disconnected,
    /// Process spawned, connect event not yet dispatched
    Connecting,
    /// Process running and reader live
    Connected,
    /// Teardown started, disconnect event not yet dispatched
    Disconnecting,
}

struct State {
    state: ConnectionState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    privileged: bool,
    /// Bumped on every successful spawn so worker threads left over from a
    /// previous process can never touch a newer one
    cycle: u64,
}

struct Listeners {
    stream: Vec<(ListenerId, Arc<dyn StreamListener>)>,
    connection: Vec<(ListenerId, Arc<dyn ConnectionListener>)>,
}

pub(crate) struct Inner {
    id: u32,
    state: Mutex<State>,
    gate: Condvar,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
    bridge: Arc<Bridge>,
}

/// Connection to an interactive shell subprocess
///
/// Cheap to clone; all clones share the same process. The process is not
/// killed when the last clone is dropped — call [`disconnect`] or
/// [`destroy`] to end it.
///
/// [`disconnect`]: Connection::disconnect
/// [`destroy`]: Connection::destroy
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Create a new, disconnected connection
    pub fn new() -> Self {
        let id = CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;

        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    state: ConnectionState::Disconnected,
                    child: None,
                    stdin: None,
                    privileged: false,
                    cycle: 0,
                }),
                gate: Condvar::new(),
                listeners: Mutex::new(Listeners {
                    stream: Vec::new(),
                    connection: Vec::new(),
                }),
                next_listener: AtomicU64::new(1),
                bridge: Arc::new(Bridge::new()),
            }),
        }
    }

    /// This connection's process-wide unique id
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Spawn the shell process and start the background reader
    ///
    /// With `request_privilege`, tries `su` first and falls back to `sh`
    /// when the privileged spawn fails. Returns `true` when already
    /// connected. With `block_until_ready`, the call returns only after the
    /// connect event has been delivered to all connection listeners (the
    /// event is dispatched from a separate thread and is not synchronous
    /// with the spawn).
    ///
    /// stderr is merged into the output stream; use [`connect_with`] to
    /// discard it instead.
    ///
    /// [`connect_with`]: Connection::connect_with
    pub fn connect(&self, request_privilege: bool, block_until_ready: bool) -> bool {
        self.connect_with(request_privilege, block_until_ready, false)
    }

    /// [`connect`](Connection::connect) with explicit stderr handling
    pub fn connect_with(
        &self,
        request_privilege: bool,
        block_until_ready: bool,
        discard_stderr: bool,
    ) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        if alive(&mut st) {
            return true;
        }

        st.state = ConnectionState::Connecting;

        let candidates: &[&str] = if request_privilege {
            &["su", "sh"]
        } else {
            &["sh"]
        };

        let mut spawned = false;
        for &program in candidates {
            match OsCommand::new(program)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
            {
                Ok(mut child) => {
                    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
                    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
                        let _ = child.kill();
                        let _ = child.wait();
                        continue;
                    };

                    debug!(id = self.inner.id, program, "shell process spawned");

                    st.child = Some(child);
                    st.stdin = Some(stdin);
                    st.privileged = program == "su";
                    st.cycle += 1;

                    if !self.start_workers(&mut st, stdout, stderr, discard_stderr) {
                        teardown_locked(&self.inner, &mut st);
                        st.state = ConnectionState::Disconnected;
                        return false;
                    }

                    spawned = true;
                    break;
                }
                Err(err) => {
                    debug!(id = self.inner.id, program, %err, "failed to spawn shell candidate");
                }
            }
        }

        if !spawned {
            st.state = ConnectionState::Disconnected;
            return false;
        }

        if block_until_ready {
            while st.state == ConnectionState::Connecting && alive(&mut st) {
                let (guard, _) = self.inner.gate.wait_timeout(st, GATE_RECHECK).unwrap();
                st = guard;
            }
        }

        true
    }

    /// Wire up the event queue and spawn the reader, dispatch and stderr
    /// drain threads for a freshly spawned process
    fn start_workers(
        &self,
        st: &mut MutexGuard<'_, State>,
        stdout: ChildStdout,
        stderr: ChildStderr,
        discard_stderr: bool,
    ) -> bool {
        let (tx, rx) = async_channel::unbounded();
        let cycle = st.cycle;
        self.inner.bridge.set_connected(true);

        // The shell rebinds its own stderr onto the stdout pipe, so the
        // drain thread below sees EOF right away. In discard mode the drain
        // keeps swallowing stderr for the life of the process.
        if !discard_stderr {
            if let Some(stdin) = st.stdin.as_mut() {
                let _ = stdin
                    .write_all(b"exec 2>&1\n")
                    .and_then(|_| stdin.flush());
            }
        }

        let id = self.inner.id;

        let drain = thread::Builder::new()
            .name(format!("shell-stream-drain-{id}"))
            .spawn(move || drain_loop(stderr));

        let dispatch = {
            let inner = Arc::clone(&self.inner);
            thread::Builder::new()
                .name(format!("shell-stream-dispatch-{id}"))
                .spawn(move || dispatch_loop(inner, rx, cycle))
        };

        let reader = {
            let inner = Arc::clone(&self.inner);
            thread::Builder::new()
                .name(format!("shell-stream-reader-{id}"))
                .spawn(move || reader_loop(inner, stdout, tx, cycle))
        };

        drain.is_ok() && dispatch.is_ok() && reader.is_ok()
    }

    /// Whether the shell process exists and has not exited
    ///
    /// Cheap and non-blocking; safe to poll continuously from any thread.
    pub fn is_connected(&self) -> bool {
        alive(&mut self.inner.state.lock().unwrap())
    }

    /// Whether the connection runs with elevated privileges
    pub fn is_privileged(&self) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        st.privileged && alive(&mut st)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().state
    }

    /// Write lines to the shell, appending a newline to each
    ///
    /// Equivalent to typing the lines and hitting enter. Returns `false`
    /// without writing when not connected and on any pipe error; errors
    /// never cross this boundary, poll [`is_connected`] instead.
    ///
    /// [`is_connected`]: Connection::is_connected
    pub fn write_lines(&self, lines: &[&str]) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        if !alive(&mut st) {
            return false;
        }
        let Some(stdin) = st.stdin.as_mut() else {
            return false;
        };

        for line in lines {
            let written = stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"));
            if let Err(err) = written {
                debug!(id = self.inner.id, %err, "stdin write failed");
                return false;
            }
        }

        stdin.flush().is_ok()
    }

    /// Write a string to the shell as-is, without a trailing newline
    pub fn write(&self, out: &str) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        if !alive(&mut st) {
            return false;
        }
        let Some(stdin) = st.stdin.as_mut() else {
            return false;
        };

        stdin
            .write_all(out.as_bytes())
            .and_then(|_| stdin.flush())
            .is_ok()
    }

    /// Ask the shell to exit and block until teardown completes
    ///
    /// Best-effort: a foreground command hogging the shell never sees the
    /// `exit`, in which case only [`destroy`](Connection::destroy) will end
    /// the process. Returns immediately when not connected.
    pub fn disconnect(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if !alive(&mut st) {
            return;
        }

        if let Some(stdin) = st.stdin.as_mut() {
            let _ = stdin
                .write_all(b"exit $?\n")
                .and_then(|_| stdin.flush());
        }

        st.state = ConnectionState::Disconnecting;

        // a concurrent reconnect starts a new cycle; stop waiting for ours
        let cycle = st.cycle;
        while st.state != ConnectionState::Disconnected && st.cycle == cycle {
            let (guard, _) = self.inner.gate.wait_timeout(st, GATE_RECHECK).unwrap();
            st = guard;
        }
    }

    /// Force-kill the shell process and close all pipes
    ///
    /// Does not wait for an ongoing command. Idempotent; the disconnect
    /// event is dispatched once the reader thread observes the pipe close.
    pub fn destroy(&self) {
        let mut st = self.inner.state.lock().unwrap();
        teardown_locked(&self.inner, &mut st);
    }

    /// Register a listener for every output line; the returned token removes it
    pub fn add_stream_listener(&self, listener: impl StreamListener + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap()
            .stream
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a stream listener; returns whether it was registered
    pub fn remove_stream_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let before = listeners.stream.len();
        listeners.stream.retain(|(lid, _)| *lid != id);
        listeners.stream.len() != before
    }

    /// Register a connect/disconnect listener; the returned token removes it
    pub fn add_connection_listener(
        &self,
        listener: impl ConnectionListener + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap()
            .connection
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a connection listener; returns whether it was registered
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let before = listeners.connection.len();
        listeners.connection.retain(|(lid, _)| *lid != id);
        listeners.connection.len() != before
    }

    /// Open a blocking byte reader over this connection's output
    ///
    /// See [`ConnectionReader`] for the sharing semantics.
    pub fn reader(&self) -> ConnectionReader {
        ConnectionReader::new(Arc::clone(&self.inner.bridge))
    }

    /// Open a raw writer onto this connection's stdin
    pub fn writer(&self) -> StdinWriter {
        StdinWriter::new(Arc::clone(&self.inner))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    pub(crate) fn stdin_write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        match st.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "shell stdin is closed",
            )),
        }
    }

    pub(crate) fn stdin_flush(&self) -> std::io::Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "shell stdin is closed",
            )),
        }
    }
}

fn alive(st: &mut MutexGuard<'_, State>) -> bool {
    match st.child.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
    }
}

/// Kill and reap the process, drop the pipes and park the state machine in
/// `Disconnecting` until the disconnect event clears the gate. Idempotent.
fn teardown_locked(inner: &Inner, st: &mut MutexGuard<'_, State>) {
    if let Some(mut child) = st.child.take() {
        if matches!(child.try_wait(), Ok(None)) {
            kill_child(&mut child);
        }
        let _ = child.wait();

        if st.state != ConnectionState::Disconnected {
            st.state = ConnectionState::Disconnecting;
        }
    }

    st.stdin = None;
    st.privileged = false;
    inner.bridge.set_connected(false);
}

#[cfg(unix)]
fn kill_child(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if signal::kill(pid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_child(child: &mut Child) {
    let _ = child.kill();
}

/// Whether the pipe has more readable data right now (zero-timeout poll)
#[cfg(unix)]
fn has_buffered(stdout: &ChildStdout) -> bool {
    use std::os::fd::AsFd;

    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    let mut fds = [PollFd::new(stdout.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .map(|flags| flags.contains(PollFlags::POLLIN))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(not(unix))]
fn has_buffered(_stdout: &ChildStdout) -> bool {
    false
}

/// The background reader: sole consumer of the process's stdout
///
/// Splits raw chunks into lines for the dispatch queue (`\n` or bare `\r`
/// breaks a line; `\r\n` is a single break) and offers each chunk to the
/// pull bridge while one is open. On EOF the reader itself performs the
/// teardown before announcing the disconnect.
fn reader_loop(inner: Arc<Inner>, mut stdout: ChildStdout, events: Sender<StreamEvent>, cycle: u64) {
    let _ = events.send_blocking(StreamEvent::new(StreamEventKind::Connected));

    let mut buf = [0u8; READ_CHUNK];
    let mut line = Vec::new();
    let mut skip_lf = false;

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                trace!(id = inner.id, %err, "stdout read failed");
                break;
            }
        };

        let more = has_buffered(&stdout);

        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if skip_lf && byte == b'\n' {
                    skip_lf = false;
                    continue;
                }
                skip_lf = byte == b'\r';

                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                let _ = events.send_blocking(StreamEvent::line(text));
            } else {
                skip_lf = false;
                line.push(byte);
            }
        }

        // a partial write with nothing left in the pipe (a prompt, a
        // sentinel echoed without trailing newline) still becomes a line
        if !more && !line.is_empty() {
            let text = String::from_utf8_lossy(&line).into_owned();
            line.clear();
            let _ = events.send_blocking(StreamEvent::line(text));
        }

        if inner.bridge.is_active() {
            inner.bridge.offer(&buf[..n], more);
        }
    }

    if !line.is_empty() {
        let text = String::from_utf8_lossy(&line).into_owned();
        let _ = events.send_blocking(StreamEvent::line(text));
    }

    debug!(id = inner.id, "stdout closed, tearing down connection");
    let mut st = inner.state.lock().unwrap();
    if st.cycle == cycle {
        teardown_locked(&inner, &mut st);
    }
    drop(st);

    let _ = events.send_blocking(StreamEvent::new(StreamEventKind::Disconnected));
}

/// Listener delivery, decoupled from the reader so a slow callback can only
/// delay its own successors, never output drainage
fn dispatch_loop(inner: Arc<Inner>, events: Receiver<StreamEvent>, cycle: u64) {
    while let Ok(event) = events.recv_blocking() {
        trace!(id = inner.id, timestamp = %event.timestamp, "dispatching event");

        match event.kind {
            StreamEventKind::Line(text) => {
                let targets: Vec<_> = {
                    let listeners = inner.listeners.lock().unwrap();
                    listeners.stream.iter().map(|(_, l)| Arc::clone(l)).collect()
                };
                for listener in targets {
                    listener.on_line(&text);
                }
            }
            StreamEventKind::Connected => {
                let targets: Vec<_> = {
                    let listeners = inner.listeners.lock().unwrap();
                    listeners
                        .connection
                        .iter()
                        .map(|(_, l)| Arc::clone(l))
                        .collect()
                };
                for listener in targets {
                    listener.on_connect();
                }

                let mut st = inner.state.lock().unwrap();
                if st.cycle == cycle && st.state == ConnectionState::Connecting {
                    st.state = ConnectionState::Connected;
                }
                inner.gate.notify_all();
            }
            StreamEventKind::Disconnected => {
                let targets: Vec<_> = {
                    let listeners = inner.listeners.lock().unwrap();
                    listeners
                        .connection
                        .iter()
                        .map(|(_, l)| Arc::clone(l))
                        .collect()
                };
                for listener in targets {
                    listener.on_disconnect();
                }

                let mut st = inner.state.lock().unwrap();
                if st.cycle == cycle {
                    st.state = ConnectionState::Disconnected;
                }
                inner.gate.notify_all();
                break;
            }
        }
    }
}

/// Fire-and-forget stderr drain so the pipe can never fill up and block the
/// process; in merged mode it sees EOF as soon as the shell rebinds stderr
fn drain_loop(mut stderr: ChildStderr) {
    let mut buf = [0u8; READ_CHUNK];
    while matches!(stderr.read(&mut buf), Ok(n) if n > 0) {}
}
