//! Synchronous command execution over a live connection
//!
//! A [`Connection`] is asynchronous by nature: output arrives whenever the
//! process feels like producing it. [`Shell`] layers a per-command protocol
//! on top so callers get plain blocking semantics: submit the command
//! followed by `echo '<sentinel>' $?`, buffer every line until the sentinel
//! comes back, and read the exit code off the sentinel line itself. The
//! sentinel embeds the connection id, so no two connections can confuse
//! each other's boundaries, and one shell process serves any number of
//! commands without reconnecting (spawning `su` again is slow and may
//! re-prompt for privilege).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{ConnectionListener, ListenerId};
use crate::output::Output;

/// How often a waiting `execute` re-checks connection liveness and deadline
const WAIT_RECHECK: Duration = Duration::from_secs(1);

/// Characters stripped from environment variable names before use
static ENV_NAME_REJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("env name pattern"));

/// Outcome of one [`Shell::execute`] run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    output: Output,
    code: i32,
    call_index: usize,
    success: bool,
}

impl ExecutionResult {
    /// The captured output lines, sentinel line excluded
    pub fn output(&self) -> &Output {
        &self.output
    }

    /// Consume the result, keeping only the output
    pub fn into_output(self) -> Output {
        self.output
    }

    /// The captured output lines as a slice
    pub fn lines(&self) -> &[String] {
        self.output.lines()
    }

    /// Exit code of the call that ended the execution
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Index of the call that ended the execution
    pub fn call_index(&self) -> usize {
        self.call_index
    }

    /// Whether the exit code was acceptable to that call
    pub fn success(&self) -> bool {
        self.success
    }
}

/// Line capture for the execution currently waiting on its sentinel
struct Capture {
    armed: bool,
    done: bool,
    code: i32,
    lines: Vec<String>,
}

/// Shared between the executing thread and the dispatch-side listeners
struct ExecGate {
    capture: Mutex<Capture>,
    cond: Condvar,
}

/// Marks the shell inactive the moment the connection drops, waking any
/// execution parked on the gate
struct DisconnectWatch {
    active: Arc<AtomicBool>,
    gate: Arc<ExecGate>,
}

impl ConnectionListener for DisconnectWatch {
    fn on_disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _capture = self.gate.capture.lock().unwrap();
        self.gate.cond.notify_all();
    }
}

/// Synchronous command executor over a shared [`Connection`]
///
/// All executions on one `Shell` are serialized; a second concurrent
/// `execute` blocks until the first completes. Several shells may share a
/// connection, but their writes interleave on one pipe, so callers wanting
/// that must serialize externally.
pub struct Shell {
    connection: Connection,
    sentinel: String,
    exec: Mutex<()>,
    gate: Arc<ExecGate>,
    active: Arc<AtomicBool>,
    stream_listener: ListenerId,
    connection_listener: ListenerId,
}

impl Shell {
    /// Create a shell on a fresh connection
    ///
    /// Connects blocking; with `request_privilege` the connection tries `su`
    /// before falling back to an unprivileged `sh`.
    pub fn new(request_privilege: bool) -> Result<Self> {
        let connection = Connection::new();
        if !connection.connect(request_privilege, true) {
            return Err(Error::spawn_failed("no shell candidate could be started"));
        }

        Self::attach(connection)
    }

    /// Create a shell on an existing connection, connecting it if needed
    pub fn attach(connection: Connection) -> Result<Self> {
        if !connection.connect(false, true) {
            return Err(Error::spawn_failed("no shell candidate could be started"));
        }

        let sentinel = sentinel_for(connection.id());
        let gate = Arc::new(ExecGate {
            capture: Mutex::new(Capture {
                armed: false,
                done: false,
                code: 1,
                lines: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        let active = Arc::new(AtomicBool::new(true));

        let stream_listener = {
            let gate = Arc::clone(&gate);
            let sentinel = sentinel.clone();
            connection.add_stream_listener(move |line: &str| {
                let mut capture = gate.capture.lock().unwrap();
                if !capture.armed || capture.done {
                    return;
                }

                if line.contains(&sentinel) {
                    if line.starts_with(&sentinel) {
                        capture.code = match line[sentinel.len()..].trim().parse() {
                            Ok(code) => code,
                            Err(_) => {
                                warn!(line, "sentinel line carried no parsable exit code");
                                1
                            }
                        };
                    }
                    capture.done = true;
                    gate.cond.notify_all();
                } else {
                    capture.lines.push(line.to_string());
                }
            })
        };

        let connection_listener = connection.add_connection_listener(DisconnectWatch {
            active: Arc::clone(&active),
            gate: Arc::clone(&gate),
        });

        Ok(Self {
            connection,
            sentinel,
            exec: Mutex::new(()),
            gate,
            active,
            stream_listener,
            connection_listener,
        })
    }

    /// The connection this shell executes on
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether this shell is attached and its connection alive
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.connection.is_connected()
    }

    /// Whether the underlying connection runs privileged
    pub fn is_privileged(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.connection.is_privileged()
    }

    /// Execute a command with no deadline
    pub fn execute(&self, command: &Command) -> Result<ExecutionResult> {
        self.execute_inner(command, None)
    }

    /// Execute a command, giving up after `timeout`
    ///
    /// On timeout the submitted call keeps running inside the shell; there
    /// is no cancellation channel over a plain pipe, so its leftover output
    /// will interleave with later commands unless the connection is
    /// recycled. Already-captured output is discarded rather than returned
    /// truncated.
    pub fn execute_timeout(&self, command: &Command, timeout: Duration) -> Result<ExecutionResult> {
        self.execute_inner(command, Some(timeout))
    }

    /// Execute a single command string accepting exit code `0`
    pub fn run(&self, command: &str) -> Result<ExecutionResult> {
        self.execute_inner(&Command::single(command), None)
    }

    fn execute_inner(&self, command: &Command, timeout: Option<Duration>) -> Result<ExecutionResult> {
        let _serial = self.exec.lock().unwrap();

        if !self.is_active() {
            return Err(Error::NotConnected {
                id: self.connection.id(),
            });
        }

        let deadline = timeout.map(|t| (t, Instant::now() + t));
        let eol_line = format!("echo '{}' $?", self.sentinel);

        let mut code = 1;
        let mut captured = Vec::new();
        let mut index = 0;

        for (call_index, call) in command.calls().iter().enumerate() {
            index = call_index;
            self.arm();

            debug!(
                id = self.connection.id(),
                call_index,
                command = call.command(),
                "submitting call"
            );

            if !self.connection.write_lines(&[call.command(), &eol_line]) {
                self.disarm();
                return Err(Error::WriteFailed {
                    id: self.connection.id(),
                });
            }

            match self.wait_for_sentinel(deadline) {
                Ok((call_code, lines)) => {
                    code = call_code;
                    captured = lines;
                }
                Err(err) => {
                    self.disarm();
                    return Err(err);
                }
            }

            if call.accepts(code) {
                self.disarm();
                return Ok(ExecutionResult {
                    output: Output::from(captured),
                    code,
                    call_index,
                    success: true,
                });
            }
        }

        self.disarm();
        Ok(ExecutionResult {
            output: Output::from(captured),
            code,
            call_index: index,
            success: false,
        })
    }

    /// Park the calling thread until the sentinel shows up, the connection
    /// drops, or the deadline passes; wakes every second to re-check
    fn wait_for_sentinel(
        &self,
        deadline: Option<(Duration, Instant)>,
    ) -> Result<(i32, Vec<String>)> {
        let mut capture = self.gate.capture.lock().unwrap();

        loop {
            if capture.done {
                let lines = std::mem::take(&mut capture.lines);
                return Ok((capture.code, lines));
            }

            if !self.active.load(Ordering::SeqCst) || !self.connection.is_connected() {
                return Err(Error::ConnectionLost {
                    id: self.connection.id(),
                });
            }

            let wait = match deadline {
                Some((total, at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(Error::Timeout {
                            millis: total.as_millis() as u64,
                        });
                    }
                    WAIT_RECHECK.min(at - now)
                }
                None => WAIT_RECHECK,
            };

            let (guard, _) = self.gate.cond.wait_timeout(capture, wait).unwrap();
            capture = guard;
        }
    }

    fn arm(&self) {
        let mut capture = self.gate.capture.lock().unwrap();
        capture.armed = true;
        capture.done = false;
        capture.code = 1;
        capture.lines.clear();
    }

    fn disarm(&self) {
        let mut capture = self.gate.capture.lock().unwrap();
        capture.armed = false;
        capture.done = false;
        capture.lines.clear();
    }

    /// Read an environment variable inside the shell process
    ///
    /// Built purely on [`execute`](Shell::execute); the name is stripped of
    /// anything outside `[A-Za-z0-9_-]` before substitution.
    pub fn get_env(&self, name: &str) -> Option<String> {
        let name = ENV_NAME_REJECT.replace_all(name, "");
        let result = self.run(&format!("echo ${name}")).ok()?;

        if result.success() {
            result.output().last_line().map(str::to_string)
        } else {
            None
        }
    }

    /// Export an environment variable inside the shell process
    pub fn set_env(&self, name: &str, value: impl std::fmt::Display) -> bool {
        let name = ENV_NAME_REJECT.replace_all(name, "");
        let value = value.to_string().replace('\'', r"'\''");

        self.run(&format!("export {name}='{value}'"))
            .map(|result| result.success())
            .unwrap_or(false)
    }

    /// Detach from the connection without destroying it
    ///
    /// The shell stops working; the connection and any other listeners on
    /// it keep running. Also called on drop.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.connection.remove_stream_listener(self.stream_listener);
            self.connection
                .remove_connection_listener(self.connection_listener);
        }
    }

    /// Destroy the underlying connection
    pub fn destroy(&self) {
        self.connection.destroy();
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.close();
    }
}

/// Boundary marker for one connection; embeds the connection id so two
/// connections can never produce colliding sentinels
fn sentinel_for(id: u32) -> String {
    format!("[STREAM:-ID({id})-:EOL]")
}
