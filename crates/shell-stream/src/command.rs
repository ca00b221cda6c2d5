//! Command descriptors with fallback calls
//!
//! Minimal shell environments differ in which tools they ship and where:
//! a plain `ls` may be missing while `busybox ls` or `toybox ls` works, and
//! the same tool can even report results through different exit codes. A
//! [`Command`] deals with this by holding an ordered list of [`Call`]s; the
//! executor runs them in order and stops at the first one that exits with an
//! acceptable code.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// All-in-one binaries every [`Command`] knows about out of the box.
/// `None` stands for the bare, unprefixed variant.
const BUILTIN_BINARIES: [&str; 3] = ["toybox", "busybox", "toolbox"];

/// Binaries registered at runtime via [`Command::register_binary`]
static EXTRA_BINARIES: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Placeholder that [`Command::add_populated`] substitutes with each binary
const BIN_PLACEHOLDER: &str = "%{bin}";

/// One concrete shell command string plus its acceptable exit codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    command: String,
    result_codes: Vec<i32>,
}

impl Call {
    /// Create a call that accepts only exit code `0`
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_codes(command, [0])
    }

    /// Create a call with an explicit set of acceptable exit codes
    ///
    /// An empty set falls back to `[0]`; a call with no acceptable code at
    /// all could never succeed.
    pub fn with_codes(command: impl Into<String>, codes: impl IntoIterator<Item = i32>) -> Self {
        let mut result_codes: Vec<i32> = codes.into_iter().collect();
        if result_codes.is_empty() {
            result_codes.push(0);
        }

        Self {
            command: command.into(),
            result_codes,
        }
    }

    /// The shell command string
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The acceptable exit codes, in registration order
    pub fn result_codes(&self) -> &[i32] {
        &self.result_codes
    }

    /// Check whether an exit code is acceptable to this call
    pub fn accepts(&self, code: i32) -> bool {
        self.result_codes.contains(&code)
    }
}

/// Ordered list of [`Call`] fallbacks representing one logical operation
///
/// The set of known all-in-one binaries is snapshotted when the `Command` is
/// created; registering more binaries later does not change existing
/// instances. The executor never mutates a `Command`.
#[derive(Debug, Clone, Default)]
pub struct Command {
    calls: Vec<Call>,
    binaries: Vec<Option<String>>,
}

impl Command {
    /// Create an empty command
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            binaries: binary_candidates(),
        }
    }

    /// Create a command with a single call accepting exit code `0`
    pub fn single(command: impl Into<String>) -> Self {
        let mut out = Self::new();
        out.add_call(command);
        out
    }

    /// Register an additional all-in-one binary, process-wide
    ///
    /// Only commands created after the registration will see the binary.
    pub fn register_binary(bin: impl Into<String>) {
        let bin = bin.into();
        let mut extras = EXTRA_BINARIES.lock().unwrap();
        if !extras.contains(&bin) && !BUILTIN_BINARIES.contains(&bin.as_str()) {
            extras.push(bin);
        }
    }

    /// Append a call accepting only exit code `0`
    pub fn add_call(&mut self, command: impl Into<String>) -> &mut Self {
        self.calls.push(Call::new(command));
        self
    }

    /// Append a call with an explicit set of acceptable exit codes
    pub fn add_call_with_codes(
        &mut self,
        command: impl Into<String>,
        codes: impl IntoIterator<Item = i32>,
    ) -> &mut Self {
        self.calls.push(Call::with_codes(command, codes));
        self
    }

    /// Append one call per known all-in-one binary
    ///
    /// If the command contains `%{bin}`, each call substitutes the
    /// placeholder with the binary name (or the empty string for the bare
    /// variant). Otherwise the binary name is prepended:
    ///
    /// ```
    /// use shell_stream::Command;
    ///
    /// let mut cmd = Command::new();
    /// cmd.add_populated("ls /", [0]);
    /// // -> "ls /", "toybox ls /", "busybox ls /", "toolbox ls /"
    /// ```
    pub fn add_populated(
        &mut self,
        command: impl Into<String>,
        codes: impl IntoIterator<Item = i32> + Clone,
    ) -> &mut Self {
        let command = command.into();

        for bin in self.binaries.clone() {
            let expanded = match (&bin, command.contains(BIN_PLACEHOLDER)) {
                (Some(bin), true) => command.replace(BIN_PLACEHOLDER, bin),
                (Some(bin), false) => format!("{bin} {command}"),
                (None, true) => command.replace(BIN_PLACEHOLDER, ""),
                (None, false) => command.clone(),
            };

            self.calls.push(Call::with_codes(expanded, codes.clone()));
        }

        self
    }

    /// Append calls produced by a callback, invoked once per known binary
    ///
    /// The callback receives `None` for the bare variant and may return
    /// `None` to skip a binary entirely.
    pub fn add_calls_with(
        &mut self,
        mut creator: impl FnMut(Option<&str>) -> Option<Call>,
    ) -> &mut Self {
        for bin in self.binaries.clone() {
            if let Some(call) = creator(bin.as_deref()) {
                self.calls.push(call);
            }
        }

        self
    }

    /// All calls in execution order
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Number of calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the command holds no calls
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The call at a position; negative positions count from the end
    pub fn call_at(&self, pos: isize) -> Option<&Call> {
        let loc = if pos < 0 {
            self.calls.len().checked_sub(pos.unsigned_abs())?
        } else {
            pos as usize
        };

        self.calls.get(loc)
    }
}

/// Snapshot of the current binary candidates: runtime-registered binaries
/// first, then the bare variant, then the built-in all-in-one binaries.
pub(crate) fn binary_candidates() -> Vec<Option<String>> {
    let extras = EXTRA_BINARIES.lock().unwrap();

    let mut out: Vec<Option<String>> = extras.iter().cloned().map(Some).collect();
    out.push(None);
    out.extend(BUILTIN_BINARIES.iter().map(|b| Some((*b).to_string())));
    out
}
