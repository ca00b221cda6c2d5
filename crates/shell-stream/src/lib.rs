//! Persistent interactive shell sessions over plain pipes
//!
//! This crate drives a long-lived shell subprocess (optionally
//! privilege-elevated via `su`) as if it were a synchronous command API,
//! while a single background reader consumes the process output
//! continuously. Three access patterns share that one output pipe without
//! stealing bytes from each other:
//!
//! - listeners receive every output line asynchronously ([`Connection`]),
//! - a pull-style consumer can read the raw byte stream blocking
//!   ([`ConnectionReader`]),
//! - and [`Shell`] turns "run this command" into a blocking call that
//!   returns exactly that command's output and exit code, using a sentinel
//!   echo to find the output boundary.
//!
//! ```no_run
//! use shell_stream::{Command, Shell};
//!
//! # fn main() -> shell_stream::Result<()> {
//! let shell = Shell::new(false)?;
//!
//! let result = shell.run("echo hello")?;
//! assert_eq!(result.lines(), ["hello"]);
//! assert_eq!(result.code(), 0);
//!
//! // fall back to all-in-one binaries on exotic environments
//! let mut df = Command::new();
//! df.add_populated("df /data", [0]);
//! let fallback = shell.execute(&df)?;
//! println!("{} (call {})", fallback.code(), fallback.call_index());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod connection;
pub mod error;
pub mod event;
pub mod output;
pub mod probe;
pub mod reader;
pub mod shell;
pub mod stdin;

pub use command::{Call, Command};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use event::{ConnectionListener, ListenerId, StreamEvent, StreamEventKind, StreamListener};
pub use output::Output;
pub use probe::Probe;
pub use reader::ConnectionReader;
pub use shell::{ExecutionResult, Shell};
pub use stdin::StdinWriter;
