//! PTY (Pseudoterminal) session launching
//!
//! This module allocates a pseudoterminal, forks a child that becomes the
//! leader of a new session with the PTY slave as its controlling terminal,
//! and hands the non-blocking master back to the caller.

#[cfg(unix)]
mod master;
#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use master::{ChildExit, MasterHandle};
#[cfg(unix)]
pub use unix::{launch, SessionLauncher};

/// Shell executed when the launcher runs with [`crate::config::ShellPolicy::Fixed`]
pub const FIXED_SHELL: &str = "/bin/sh";

/// The only environment entry the launched program receives
pub const CHILD_ENV: &str = "TERM=dumb";

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Invalid shell path {path:?}: {reason}")]
    InvalidShell { path: String, reason: &'static str },

    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] nix::Error),

    #[error("Failed to set close-on-exec on PTY master: {0}")]
    CloseOnExec(#[source] nix::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] nix::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] nix::Error),

    #[error("Failed to set non-blocking mode: {0}")]
    SetNonBlocking(#[source] nix::Error),

    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Child process killed by signal: {0}")]
    ChildSignaled(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// A setup step performed by the forked child before the shell replaces it.
///
/// The child cannot report errors through a return value, so each step exits
/// with its own status code. The parent recovers the step from the exit code
/// with [`ChildStep::from_exit_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStep {
    /// `setsid()` to become a session leader
    Setsid,
    /// Reopening the slave device by path
    OpenSlave,
    /// `TIOCSCTTY` on the reopened slave
    ControllingTerminal,
    /// `dup2()` onto stdin, stdout and stderr
    Redirect,
    /// `execve()` of the shell
    Exec,
}

impl ChildStep {
    pub const ALL: [ChildStep; 5] = [
        ChildStep::Setsid,
        ChildStep::OpenSlave,
        ChildStep::ControllingTerminal,
        ChildStep::Redirect,
        ChildStep::Exec,
    ];

    /// Exit status used by the child when this step fails
    pub fn exit_code(self) -> i32 {
        match self {
            ChildStep::Setsid => 121,
            ChildStep::OpenSlave => 122,
            ChildStep::ControllingTerminal => 123,
            ChildStep::Redirect => 124,
            // Same code a shell uses for "command not found"
            ChildStep::Exec => 127,
        }
    }

    /// Map a child exit status back to the step that failed
    pub fn from_exit_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.exit_code() == code)
    }

    /// Diagnostic written to the child's stderr before exiting.
    ///
    /// Static bytes so the child never allocates between fork and exec.
    pub(crate) fn message(self) -> &'static [u8] {
        match self {
            ChildStep::Setsid => b"pty-session: setsid failed\n",
            ChildStep::OpenSlave => b"pty-session: failed to open PTY slave\n",
            ChildStep::ControllingTerminal => {
                b"pty-session: failed to set controlling terminal\n"
            },
            ChildStep::Redirect => b"pty-session: failed to redirect stdio to PTY slave\n",
            ChildStep::Exec => b"pty-session: failed to execute shell\n",
        }
    }
}

impl std::fmt::Display for ChildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChildStep::Setsid => "setsid",
            ChildStep::OpenSlave => "open slave",
            ChildStep::ControllingTerminal => "set controlling terminal",
            ChildStep::Redirect => "redirect stdio",
            ChildStep::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_step_exit_codes_are_distinct() {
        for (i, a) in ChildStep::ALL.iter().enumerate() {
            for b in &ChildStep::ALL[i + 1..] {
                assert_ne!(a.exit_code(), b.exit_code(), "{} and {}", a, b);
            }
        }
    }

    #[test]
    fn test_child_step_round_trip() {
        for step in ChildStep::ALL {
            assert_eq!(ChildStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(ChildStep::from_exit_code(0), None);
        assert_eq!(ChildStep::from_exit_code(1), None);
    }

    #[test]
    fn test_child_messages_end_with_newline() {
        for step in ChildStep::ALL {
            assert!(step.message().ends_with(b"\n"));
        }
    }

    #[test]
    fn test_invalid_shell_display() {
        let err = PtyError::InvalidShell {
            path: "sh".to_string(),
            reason: "not an absolute path",
        };
        assert_eq!(
            err.to_string(),
            "Invalid shell path \"sh\": not an absolute path"
        );
    }
}
