// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PLL status monitor.
//!
//! Follows the clock daemon's status FIFO and mirrors the parsed state of
//! both servos for local consumers (the synchronisation supervisor needs
//! to know whether the system clock is synchronised before it trusts the
//! timestamps). An `x` marker from the daemon means lines were lost; the
//! mirrored state is invalidated until the next complete report.

use bpmd::pll::{parse_status_line, StatusLine, SyncState};
use bpmd::Shutdown;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Last reported state of one servo.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServoStatus {
    pub stage: u32,
    pub sync: SyncState,
    pub frequency_error: i32,
    pub phase_error: i32,
    pub dac: u32,
    /// False after a resync marker until the next status line arrives.
    pub valid: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    machine: ServoStatus,
    system: ServoStatus,
}

/// Mirror of the clock daemon's status stream.
pub struct ClockMonitor {
    state: Mutex<MonitorState>,
}

impl ClockMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MonitorState::default()),
        })
    }

    pub fn machine(&self) -> ServoStatus {
        self.state.lock().machine
    }

    pub fn system(&self) -> ServoStatus {
        self.state.lock().system
    }

    pub fn system_clock_synchronised(&self) -> bool {
        let system = self.system();
        system.valid && system.sync == SyncState::Synchronised
    }

    fn apply(&self, line: &str) {
        let Some(parsed) = parse_status_line(line) else {
            log::warn!("malformed status line \"{}\"", line);
            return;
        };
        let mut state = self.state.lock();
        match parsed {
            StatusLine::Resync => {
                // Lines were lost: nothing mirrored can be trusted.
                state.machine.valid = false;
                state.system.valid = false;
            }
            StatusLine::Stage {
                prefix,
                stage,
                sync,
            } => {
                let servo = match prefix {
                    'm' => &mut state.machine,
                    's' => &mut state.system,
                    _ => return,
                };
                servo.stage = stage;
                servo.sync = sync;
                servo.valid = true;
            }
            StatusLine::Verbose {
                prefix,
                frequency_error,
                phase_error,
                dac,
            } => {
                let servo = match prefix {
                    'm' => &mut state.machine,
                    's' => &mut state.system,
                    _ => return,
                };
                servo.frequency_error = frequency_error;
                servo.phase_error = phase_error;
                servo.dac = dac;
            }
        }
    }

    /// Follow the status FIFO until shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        status_fifo: &Path,
        shutdown: Arc<Shutdown>,
    ) -> io::Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        let path = status_fifo.to_path_buf();
        std::thread::Builder::new()
            .name("pll-status-monitor".into())
            .spawn(move || {
                let mut pending = String::new();
                let mut chunk = [0u8; 256];
                let mut fifo = loop {
                    if shutdown.is_set() {
                        return;
                    }
                    match OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_NONBLOCK)
                        .open(&path)
                    {
                        Ok(fifo) => break fifo,
                        Err(_) => {
                            // The clock daemon may not be up yet.
                            shutdown.wait_timeout(Duration::from_secs(1));
                        }
                    }
                };
                while !shutdown.is_set() {
                    match fifo.read(&mut chunk) {
                        Ok(0) => {
                            shutdown.wait_timeout(Duration::from_millis(200));
                        }
                        Ok(n) => {
                            pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
                            while let Some(at) = pending.find('\n') {
                                let line: String = pending.drain(..=at).collect();
                                monitor.apply(line.trim_end_matches('\n'));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            shutdown.wait_timeout(Duration::from_millis(50));
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::error!("status fifo read failed: {}", e);
                            return;
                        }
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_both_servos() {
        let monitor = ClockMonitor::new();
        monitor.apply("ms3 2");
        monitor.apply("ss2 1");
        monitor.apply("mv-1 2 32768");
        assert_eq!(monitor.machine().stage, 3);
        assert_eq!(monitor.machine().phase_error, 2);
        assert!(monitor.machine().valid);
        assert_eq!(monitor.system().stage, 2);
        assert!(!monitor.system_clock_synchronised());
        monitor.apply("ss3 2");
        assert!(monitor.system_clock_synchronised());
    }

    #[test]
    fn resync_marker_invalidates_state() {
        let monitor = ClockMonitor::new();
        monitor.apply("ss3 2");
        assert!(monitor.system_clock_synchronised());
        monitor.apply("x");
        assert!(!monitor.system_clock_synchronised());
        monitor.apply("ss3 2");
        assert!(monitor.system_clock_synchronised());
    }
}
