//! Helpers shared by the PTY session integration tests

#![allow(dead_code)]

use std::time::{Duration, Instant};

use pty_session::{ChildExit, MasterHandle};

/// Read from the master until `needle` shows up or the timeout expires
pub fn read_until(handle: &MasterHandle, needle: &str, timeout: Duration) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if handle.poll_read(50).unwrap_or(false) {
            match handle.read(&mut buf) {
                Ok(n) if n > 0 => output.extend_from_slice(&buf[..n]),
                _ => {},
            }
        }
        if String::from_utf8_lossy(&output).contains(needle) {
            break;
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

/// Read everything the child writes until it exits, then drain what is left
pub fn read_to_exit(handle: &mut MasterHandle, timeout: Duration) -> (String, Option<ChildExit>) {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + timeout;
    let mut exit = None;

    while Instant::now() < deadline {
        if handle.poll_read(50).unwrap_or(false) {
            if let Ok(n) = handle.read(&mut buf) {
                output.extend_from_slice(&buf[..n]);
            }
        }
        if let Ok(Some(status)) = handle.try_wait() {
            exit = Some(status);
            break;
        }
    }

    loop {
        match handle.read(&mut buf) {
            Ok(n) if n > 0 => output.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }

    (String::from_utf8_lossy(&output).into_owned(), exit)
}

/// Send one line of input to the session
pub fn send_line(handle: &MasterHandle, line: &str) {
    handle
        .write_all(line.as_bytes())
        .expect("Failed to write command");
    handle.write_all(b"\n").expect("Failed to write newline");
}
