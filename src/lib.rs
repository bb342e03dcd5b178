//! PTY session launcher
//!
//! Starts an interactive program as the leader of a new session whose
//! controlling terminal is a freshly allocated pseudoterminal:
//!
//! - `pty`: PTY allocation, fork/exec of the session leader, the master handle
//! - `config`: shell selection and its layered configuration
//!
//! The launched program sees the PTY slave on stdin, stdout and stderr and an
//! environment of exactly `TERM=dumb`. The caller gets the master back in
//! non-blocking mode, ready to register with a poll-style event loop.

pub mod config;
pub mod pty;

pub use config::{LaunchConfig, ShellPolicy};
#[cfg(unix)]
pub use pty::{launch, ChildExit, MasterHandle, SessionLauncher};
pub use pty::{ChildStep, PtyError, PtyResult};
