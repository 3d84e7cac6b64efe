// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock synchronisation supervisor.
//!
//! Bringing a clock in step with the external synchronisation trigger is
//! a three-way handshake: the operator announces the synchronisation
//! (we put the servo into tracking with an `s1` command), the trigger
//! arrives (the hardware latches the clock), and we confirm with `s2`.
//! For the system clock the trigger lands on a whole second, so while a
//! synchronisation is pending this supervisor keeps re-arming the
//! expected trigger time with the next anticipated second.

use crate::device::EventDevice;
use bpmd::events::EventHandler;
use bpmd::sync::BinarySemaphore;
use bpmd::Shutdown;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Writes command lines to the clock daemon's command FIFO.
pub struct PllCommander {
    path: PathBuf,
}

impl PllCommander {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn send(&self, command: &str) {
        let opened = OpenOptions::new().write(true).open(&self.path);
        match opened {
            Ok(mut fifo) => {
                if let Err(e) = fifo.write_all(format!("{}\n", command).as_bytes()) {
                    log::error!("writing {} to {} failed: {}", command, self.path.display(), e);
                }
            }
            Err(e) => log::error!("cannot open {}: {}", self.path.display(), e),
        }
    }
}

/// Hook for arming the hardware's expected trigger times. Device-backed
/// in production; a recording stub in the tests and in sim mode.
pub trait ClockSetter: Send + Sync {
    fn set_system_clock_time(&self, time: SystemTime);
    fn set_machine_clock_time(&self);
}

impl ClockSetter for Arc<EventDevice> {
    fn set_system_clock_time(&self, time: SystemTime) {
        if let Err(e) = EventDevice::set_system_clock_time(self, time) {
            log::error!("arming system clock time failed: {}", e);
        }
    }

    fn set_machine_clock_time(&self) {
        if let Err(e) = EventDevice::set_machine_clock_time(self) {
            log::error!("arming machine clock time failed: {}", e);
        }
    }
}

#[derive(Default)]
struct Pending {
    machine: bool,
    system: bool,
}

/// The supervisor itself; also the handler for the synchronisation
/// trigger event.
pub struct SyncSupervisor {
    pending: Mutex<Pending>,
    wake: BinarySemaphore,
    pll: PllCommander,
    setter: Arc<dyn ClockSetter>,
}

impl SyncSupervisor {
    pub fn new(pll: PllCommander, setter: Arc<dyn ClockSetter>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending::default()),
            wake: BinarySemaphore::new(false),
            pll,
            setter,
        })
    }

    /// The next trigger is a machine-clock synchronisation trigger.
    pub fn synchronise_machine_clock(&self) {
        let mut pending = self.pending.lock();
        pending.machine = true;
        self.pll.send("ms1");
        self.setter.set_machine_clock_time();
        drop(pending);
        self.wake.signal();
    }

    /// The next trigger is a system-clock synchronisation trigger.
    pub fn synchronise_system_clock(&self) {
        let mut pending = self.pending.lock();
        pending.system = true;
        self.pll.send("ss1");
        drop(pending);
        self.wake.signal();
    }

    /// Run the re-arming loop: while a system-clock synchronisation is
    /// pending, program the next whole second as the expected trigger
    /// time, then sleep until 200 ms past it.
    pub fn spawn(self: &Arc<Self>, shutdown: Arc<Shutdown>) -> io::Result<JoinHandle<()>> {
        let supervisor = Arc::clone(self);
        std::thread::Builder::new()
            .name("sync-supervisor".into())
            .spawn(move || {
                while !shutdown.is_set() {
                    if !supervisor.wake.wait_for(Duration::from_millis(200)) {
                        continue;
                    }
                    while supervisor.pending.lock().system && !shutdown.is_set() {
                        let now = SystemTime::now();
                        let nanos = now
                            .duration_since(SystemTime::UNIX_EPOCH)
                            .map(|d| d.subsec_nanos())
                            .unwrap_or(0);
                        let next_second = now + Duration::from_nanos(1_000_000_000 - nanos as u64);
                        supervisor.setter.set_system_clock_time(next_second);
                        // Wait until 200 ms past the armed second: enough
                        // to receive the trigger even with a sizeable NTP
                        // error, and enough margin to re-arm.
                        let delay = Duration::from_nanos(1_200_000_000 - nanos as u64);
                        shutdown.wait_timeout(delay);
                    }
                }
            })
    }
}

impl EventHandler for SyncSupervisor {
    /// The synchronisation trigger arrived: clock setting is complete,
    /// confirm it to the servos.
    fn on_event(&self, _param: i32) {
        let mut pending = self.pending.lock();
        if pending.machine {
            pending.machine = false;
            self.pll.send("ms2");
        }
        if pending.system {
            pending.system = false;
            self.pll.send("ss2");
        }
        drop(pending);
        self.wake.signal();
    }
}
