//! Unix session launcher
//!
//! Opens a PTY pair with the POSIX API and forks a session leader onto it:
//! - posix_openpt() / grantpt() / unlockpt() / ptsname() for the pair
//! - setsid() and TIOCSCTTY in the child for the new session
//! - execve() with an explicit one-entry environment

use std::ffi::{CStr, CString};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::libc::{self, c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, fork, setsid, write, ForkResult};

use super::{ChildStep, MasterHandle, PtyError, PtyResult, CHILD_ENV};
use crate::config::{check_shell_path, LaunchConfig, ShellPolicy};

/// Launch `shell` on a new PTY session with the default [`ShellPolicy`].
///
/// Returns the non-blocking master in the parent. The child never returns
/// from this call: it either becomes `shell` or exits with the code of the
/// [`ChildStep`] that failed.
pub fn launch(shell: &str) -> PtyResult<MasterHandle> {
    SessionLauncher::default().launch(shell)
}

/// Launches interactive programs as session leaders on fresh PTYs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionLauncher {
    policy: ShellPolicy,
}

impl SessionLauncher {
    pub fn new(policy: ShellPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        Self::new(config.shell_policy)
    }

    pub fn policy(&self) -> ShellPolicy {
        self.policy
    }

    /// Open a PTY pair, fork, and exec the shell in the child
    ///
    /// # Arguments
    /// * `shell` - Absolute path of the program to run; ignored under
    ///   [`ShellPolicy::Fixed`]
    ///
    /// # Returns
    /// The PTY master, already in non-blocking mode
    pub fn launch(&self, shell: &str) -> PtyResult<MasterHandle> {
        let image = ExecImage::new(self.policy.resolve(shell))?;

        let (master, slave_path) = open_pair()?;
        let slave_cstr = CString::new(slave_path.as_str())
            .map_err(|e| PtyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        tracing::debug!(slave = %slave_path, program = ?image.program, "Opened PTY pair, forking");

        // SAFETY: the child only makes async-signal-safe calls on memory
        // prepared above, then execs or exits
        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => run_child(master.into_raw_fd(), &slave_cstr, &image),
            ForkResult::Parent { child } => {
                let handle = MasterHandle::new(master, slave_path, child);

                if let Err(e) = set_nonblocking(handle.master_fd()) {
                    tracing::warn!(pid = %child, "Failed to configure PTY master, killing child: {}", e);
                    let _ = kill(child, Signal::SIGKILL);
                    // Closes the master and reaps the killed child
                    drop(handle);
                    return Err(e);
                }

                tracing::info!(pid = %child, slave = %handle.slave_path(), "Launched PTY session");
                Ok(handle)
            },
        }
    }
}

/// Program path, argv and envp, built before fork so the child does not allocate
struct ExecImage {
    program: CString,
    // Only referenced through envp
    #[allow(dead_code)]
    env: CString,
    argv: [*const c_char; 2],
    envp: [*const c_char; 2],
}

impl ExecImage {
    fn new(program: &str) -> PtyResult<Self> {
        check_shell_path(program).map_err(|reason| PtyError::InvalidShell {
            path: program.to_string(),
            reason,
        })?;

        let program = CString::new(program).map_err(|_| PtyError::InvalidShell {
            path: program.to_string(),
            reason: "path contains a NUL byte",
        })?;
        let env = CString::new(CHILD_ENV).map_err(|e| {
            PtyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        // The pointers target the CStrings' heap buffers, which stay put when
        // the struct moves
        let argv = [program.as_ptr(), std::ptr::null()];
        let envp = [env.as_ptr(), std::ptr::null()];

        Ok(Self {
            program,
            env,
            argv,
            envp,
        })
    }
}

/// Open a PTY master and look up its slave path
fn open_pair() -> PtyResult<(OwnedFd, String)> {
    let master = open_master()?;
    grantpt(&master).map_err(PtyError::GrantPty)?;
    unlockpt(&master).map_err(PtyError::UnlockPty)?;
    let slave_path = slave_name(&master)?;

    // SAFETY: into_raw_fd gives up PtyMaster's ownership of the descriptor
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };

    Ok((master, slave_path))
}

/// Open a close-on-exec PTY master
///
/// The flag must be set before any other thread can fork, or programs exec'd
/// by those children keep the terminal alive.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_master() -> PtyResult<PtyMaster> {
    posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC).map_err(PtyError::OpenMaster)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_master() -> PtyResult<PtyMaster> {
    use nix::fcntl::FdFlag;
    use std::os::fd::AsRawFd;

    // Not every posix_openpt takes O_CLOEXEC, so a fork can still slip in
    // between these two calls
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(PtyError::CloseOnExec)?;
    Ok(master)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    nix::pty::ptsname_r(master).map_err(PtyError::PtsName)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // any other call could overwrite it
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::PtsName)
}

/// Set `O_NONBLOCK` on `fd`, keeping its other status flags
fn set_nonblocking(fd: RawFd) -> PtyResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::SetNonBlocking)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::SetNonBlocking)?;
    Ok(())
}

/// Child side of the fork: become a session leader on the slave and exec
fn run_child(master: RawFd, slave_path: &CStr, image: &ExecImage) -> ! {
    // The child must not hold the master end open
    let _ = close(master);

    if setsid().is_err() {
        child_fail(ChildStep::Setsid);
    }

    // O_NOCTTY suppresses the implicit assignment; TIOCSCTTY below makes it explicit
    let slave_fd = match open(slave_path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => child_fail(ChildStep::OpenSlave),
    };

    // SAFETY: TIOCSCTTY takes an integer argument; slave_fd is open
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } < 0 {
        child_fail(ChildStep::ControllingTerminal);
    }

    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        if dup2(slave_fd, target).is_err() {
            child_fail(ChildStep::Redirect);
        }
    }

    // Close original slave fd if it's not one of the standard fds
    if slave_fd > STDERR_FILENO {
        let _ = close(slave_fd);
    }

    // Rust runtimes ignore SIGPIPE and exec keeps ignored dispositions
    // SAFETY: installing SIG_DFL runs no handler code
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    // SAFETY: program, argv and envp are NUL-terminated and null-terminated
    // arrays owned by `image`
    unsafe {
        libc::execve(image.program.as_ptr(), image.argv.as_ptr(), image.envp.as_ptr());
    }

    child_fail(ChildStep::Exec)
}

/// Report a failed setup step on stderr and leave without running any destructors
fn child_fail(step: ChildStep) -> ! {
    let _ = write(STDERR_FILENO, step.message());
    // SAFETY: _exit is async-signal-safe and skips atexit handlers inherited
    // from the parent
    unsafe { libc::_exit(step.exit_code()) }
}
