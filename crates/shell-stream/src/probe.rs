//! Locating tools in minimal shell environments
//!
//! `which` is itself one of the tools that may be missing, and a tool that
//! exists under `busybox` may not exist bare. The probe answers "how do I
//! invoke this tool here" by trying each known all-in-one binary prefix and
//! pattern-matching the shell's complaint when the attempt does not exist.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::command::{Command, binary_candidates};
use crate::error::Result;
use crate::shell::Shell;

/// Error suffixes a shell or all-in-one binary prints for a missing tool
const MISSING_MARKERS: [&str; 2] = ["not found", "such tool"];

/// Cached tool lookups against a shell environment
#[derive(Default)]
pub struct Probe {
    found: Mutex<HashMap<String, String>>,
}

impl Probe {
    /// Create an empty probe
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an invocation of `tool` that this environment accepts
    ///
    /// Tries `tool -h` bare and under each registered all-in-one binary,
    /// accepting the first variant whose last output line is not a
    /// missing-tool complaint, so `find_command(&shell, "cat")` may come
    /// back as `"busybox cat"`. Lookups are memoized per probe.
    pub fn find_command(&self, shell: &Shell, tool: &str) -> Result<Option<String>> {
        if let Some(hit) = self.found.lock().unwrap().get(tool) {
            return Ok(Some(hit.clone()));
        }

        for bin in binary_candidates() {
            let candidate = match &bin {
                Some(bin) => format!("{bin} {tool}"),
                None => tool.to_string(),
            };

            let result = shell.run(&format!("{candidate} -h"))?;
            let Some(last) = result.output().line(-1, true) else {
                continue;
            };

            if !MISSING_MARKERS.iter().any(|m| last.ends_with(m)) {
                debug!(tool, candidate, "tool located");
                self.found
                    .lock()
                    .unwrap()
                    .insert(tool.to_string(), candidate.clone());
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Check whether a binary exists in the shell's environment
    ///
    /// Asks `which` first (populated across all-in-one binaries), then
    /// falls back to walking the `$PATH` entries by hand.
    pub fn exists(&self, shell: &Shell, binary: &str) -> Result<bool> {
        let mut which = Command::new();
        which.add_populated(format!("which '{binary}'"), [0]);

        if shell.execute(&which)?.success() {
            return Ok(true);
        }

        for dir in self.path_variable(shell) {
            if shell.run(&format!("[ -e '{dir}/{binary}' ]"))?.success() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// The shell's `$PATH`, split into its entries
    pub fn path_variable(&self, shell: &Shell) -> Vec<String> {
        shell
            .get_env("PATH")
            .map(|path| {
                path.split(':')
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
