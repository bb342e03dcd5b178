//! Owning handle for the PTY master of a launched session

use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{read, write, Pid};

use super::{PtyError, PtyResult};

/// How the session's child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Exited normally with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
}

/// Polls of the child after the master is dropped, before it gets SIGKILL
const REAP_ATTEMPTS: u32 = 50;
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// The parent's end of a launched PTY session.
///
/// Holds the non-blocking master descriptor together with the slave path and
/// the pid of the session leader. Dropping the handle closes the master,
/// which hangs up the child's terminal, then reaps the child. A child still
/// running half a second after the hang-up is killed, so a dropped handle
/// never leaves a zombie behind.
pub struct MasterHandle {
    master: ManuallyDrop<OwnedFd>,
    master_closed: bool,
    slave_path: String,
    child_pid: Pid,
    exit: Option<ChildExit>,
}

impl MasterHandle {
    pub(crate) fn new(master: OwnedFd, slave_path: String, child_pid: Pid) -> Self {
        Self {
            master: ManuallyDrop::new(master),
            master_closed: false,
            slave_path,
            child_pid,
            exit: None,
        }
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Path of the slave device the child was attached to
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Pid of the child, which is also its session id
    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    /// Check whether `O_NONBLOCK` is set on the master
    pub fn is_nonblocking(&self) -> PtyResult<bool> {
        let flags =
            fcntl(self.master.as_raw_fd(), FcntlArg::F_GETFL).map_err(PtyError::SetNonBlocking)?;
        Ok(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK))
    }

    /// Read from the PTY master (non-blocking)
    ///
    /// Returns 0 if no data is available or the slave side has been closed
    /// by every process holding it (Linux reports the latter as `EIO`).
    pub fn read(&self, buf: &mut [u8]) -> PtyResult<usize> {
        match read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            // EAGAIN and EWOULDBLOCK are the same value on Linux
            Err(Errno::EAGAIN) | Err(Errno::EIO) => Ok(0),
            Err(e) => Err(PtyError::Read(e)),
        }
    }

    /// Write to the PTY master
    ///
    /// Returns the number of bytes written, 0 if the terminal's input queue
    /// is full.
    pub fn write(&self, data: &[u8]) -> PtyResult<usize> {
        match write(self.master.as_raw_fd(), data) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(PtyError::Write(e)),
        }
    }

    /// Write all data to the PTY master, waiting for room when the queue is full
    pub fn write_all(&self, mut data: &[u8]) -> PtyResult<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                self.poll(PollFlags::POLLOUT, 100)?;
                continue;
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Poll for data available to read
    ///
    /// Returns true if data is available, false if timeout expired.
    pub fn poll_read(&self, timeout_ms: i32) -> PtyResult<bool> {
        self.poll(PollFlags::POLLIN, timeout_ms)
    }

    fn poll(&self, events: PollFlags, timeout_ms: i32) -> PtyResult<bool> {
        let mut fds = [PollFd::new(&*self.master, events)];
        let n = poll(&mut fds, timeout_ms).map_err(PtyError::Poll)?;
        Ok(n > 0 && fds[0].revents().is_some_and(|r| r.intersects(events)))
    }

    /// Check if the child process has exited, without blocking
    ///
    /// Once the child has been reaped its exit is remembered, so later calls
    /// keep returning it.
    pub fn try_wait(&mut self) -> PtyResult<Option<ChildExit>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(self.record_exit(status)),
        }
    }

    /// Wait for the child process to exit
    ///
    /// Returns the exit code, or an error if the child was killed by a signal.
    pub fn wait(&mut self) -> PtyResult<i32> {
        match self.wait_exit()? {
            ChildExit::Exited(code) => Ok(code),
            ChildExit::Signaled(signal) => Err(PtyError::ChildSignaled(signal)),
        }
    }

    /// Close the master and wait for the child to go away.
    ///
    /// Closing the last master descriptor hangs up the terminal, so the
    /// kernel sends SIGHUP to the session leader.
    pub fn hang_up(mut self) -> PtyResult<ChildExit> {
        self.close_master();
        self.wait_exit()
    }

    fn wait_exit(&mut self) -> PtyResult<ChildExit> {
        loop {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            // Stopped or continued statuses are not recorded; keep waiting
            let status = waitpid(self.child_pid, None).map_err(PtyError::Wait)?;
            self.record_exit(status);
        }
    }

    fn record_exit(&mut self, status: WaitStatus) -> Option<ChildExit> {
        let exit = match status {
            WaitStatus::Exited(_, code) => ChildExit::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ChildExit::Signaled(signal as i32),
            _ => return None,
        };
        self.exit = Some(exit);
        tracing::debug!(pid = %self.child_pid, ?exit, "PTY session child exited");
        Some(exit)
    }

    fn close_master(&mut self) {
        if !self.master_closed {
            self.master_closed = true;
            // SAFETY: guarded by master_closed, so the fd is taken exactly once
            drop(unsafe { ManuallyDrop::take(&mut self.master) });
        }
    }

    /// Reap the child after its terminal has been hung up
    fn reap_after_hang_up(&mut self) {
        for _ in 0..REAP_ATTEMPTS {
            match self.try_wait() {
                Ok(None) => thread::sleep(REAP_INTERVAL),
                // Reaped, or not our child to wait for
                Ok(Some(_)) | Err(_) => return,
            }
        }

        tracing::warn!(pid = %self.child_pid, "PTY session child survived hang-up, killing it");
        let _ = kill(self.child_pid, Signal::SIGKILL);
        if let Ok(status) = waitpid(self.child_pid, None) {
            self.record_exit(status);
        }
    }
}

impl AsRawFd for MasterHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for MasterHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl IntoRawFd for MasterHandle {
    /// Release the bare master descriptor to the caller.
    ///
    /// The caller becomes responsible for closing it and for reaping the child.
    fn into_raw_fd(self) -> RawFd {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped and the master is still open (only
        // hang_up and drop close it, and both consume the handle), so the fd
        // and the path are moved out exactly once
        let master = unsafe { ManuallyDrop::take(&mut this.master) };
        drop(unsafe { std::ptr::read(&this.slave_path) });
        master.into_raw_fd()
    }
}

impl std::fmt::Debug for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHandle")
            .field("master_fd", &self.master.as_raw_fd())
            .field("slave_path", &self.slave_path)
            .field("child_pid", &self.child_pid)
            .finish()
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        // The child only sees the hang-up once the master is closed
        self.close_master();
        if self.exit.is_none() {
            self.reap_after_hang_up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::{grantpt, posix_openpt, unlockpt};
    use std::os::fd::FromRawFd;

    /// A handle over a bare PTY master whose child is already accounted for.
    ///
    /// The exit is preset so nothing ever waits on the placeholder pid.
    fn detached_handle() -> MasterHandle {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let fd = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        let mut handle = MasterHandle::new(fd, String::from("/dev/null"), Pid::from_raw(0));
        handle.exit = Some(ChildExit::Exited(0));
        handle
    }

    #[test]
    fn test_accessors() {
        let handle = detached_handle();
        assert!(handle.master_fd() >= 0);
        assert_eq!(handle.as_raw_fd(), handle.master_fd());
        assert_eq!(handle.as_fd().as_raw_fd(), handle.master_fd());
        assert_eq!(handle.slave_path(), "/dev/null");
    }

    #[test]
    fn test_nonblocking_reflects_flags() {
        let handle = detached_handle();
        assert!(!handle.is_nonblocking().unwrap());

        let fd = handle.master_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).unwrap();
        assert!(handle.is_nonblocking().unwrap());
    }

    #[test]
    fn test_recorded_exit_is_sticky() {
        let mut handle = detached_handle();
        handle.exit = None;
        assert_eq!(
            handle.record_exit(WaitStatus::Exited(Pid::from_raw(0), 3)),
            Some(ChildExit::Exited(3))
        );

        assert_eq!(handle.try_wait().unwrap(), Some(ChildExit::Exited(3)));
        assert_eq!(handle.try_wait().unwrap(), Some(ChildExit::Exited(3)));
        assert_eq!(handle.wait().unwrap(), 3);
    }

    #[test]
    fn test_recorded_signal_is_an_error_from_wait() {
        let mut handle = detached_handle();
        handle.exit = None;
        handle.record_exit(WaitStatus::Signaled(Pid::from_raw(0), Signal::SIGHUP, false));

        assert!(matches!(handle.wait(), Err(PtyError::ChildSignaled(1))));
        assert_eq!(handle.try_wait().unwrap(), Some(ChildExit::Signaled(1)));
    }

    #[test]
    fn test_stopped_status_is_not_an_exit() {
        let mut handle = detached_handle();
        handle.exit = None;
        assert_eq!(
            handle.record_exit(WaitStatus::Stopped(Pid::from_raw(0), Signal::SIGSTOP)),
            None
        );
        handle.exit = Some(ChildExit::Exited(0));
    }

    #[test]
    fn test_hang_up_returns_recorded_exit() {
        let handle = detached_handle();
        assert_eq!(handle.hang_up().unwrap(), ChildExit::Exited(0));
    }

    #[test]
    fn test_into_raw_fd_keeps_descriptor_open() {
        let handle = detached_handle();
        let expected = handle.master_fd();
        let fd = handle.into_raw_fd();
        assert_eq!(fd, expected);

        // Still a valid descriptor, now owned by us
        assert!(fcntl(fd, FcntlArg::F_GETFD).is_ok());
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
