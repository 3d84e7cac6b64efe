// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon plumbing shared by the three services: the cooperative shutdown
//! flag, PID-file ownership with a stale-instance probe, and named-pipe
//! creation.

use parking_lot::{Condvar, Mutex};
use std::ffi::CString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Process-wide cooperative shutdown request.
///
/// Long-lived threads poll [`is_set`](Self::is_set) in their loop
/// conditions and use [`wait_timeout`](Self::wait_timeout) instead of bare
/// sleeps so that termination wakes them immediately.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep for at most `timeout`. Returns `true` if shutdown was
    /// requested (now or during the wait).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.lock.lock();
        if !self.is_set() {
            self.cond.wait_for(&mut guard, timeout);
        }
        self.is_set()
    }
}

/// Create a FIFO at `path` if it does not already exist.
pub fn create_fifo(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    // SAFETY: cpath is a valid NUL-terminated string for the call.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Probe whether `pid` names a live process (zero-signal kill).
pub fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs error checking only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Exclusive PID file. Acquiring refuses to start when an existing file
/// names a process that still responds to a zero-signal probe; a stale
/// file is silently replaced. The file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, RuntimeError> {
        if let Ok(contents) = fs::read_to_string(path) {
            log::warn!("found existing pid file {}", path.display());
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if process_alive(pid) {
                    return Err(RuntimeError::AlreadyRunning(pid));
                }
            }
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        log::debug!("created pid file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::error!("failed to unlink {}: {}", self.path.display(), e);
        }
    }
}
