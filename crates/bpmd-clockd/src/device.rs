// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-backed clock I/O.
//!
//! All clock access goes through ioctl calls on the event device node.
//! The trigger reads block in the driver for up to 100 ms and fail with
//! `EAGAIN` on timeout, which the servo treats as a lost clock.

use bpmd::hw::ClockSource;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

// Event-device ioctl numbering.
const GET_MC_TRIGGER: libc::c_ulong = 0x8008_6509;
const GET_SC_TRIGGER: libc::c_ulong = 0x8008_650A;
const SET_DAC_A: libc::c_ulong = 0x0000_6510;
const SET_DAC_B: libc::c_ulong = 0x0000_6511;
const SET_MC_FREQUENCY: libc::c_ulong = 0x4004_6512;
const SET_MC_PHASE: libc::c_ulong = 0x4008_6513;
const SET_MC_LOCKED: libc::c_ulong = 0x4004_6514;
const SET_SC_PHASE: libc::c_ulong = 0x4008_6515;
const SET_SC_LOCKED: libc::c_ulong = 0x4004_6516;
const SET_NCO: libc::c_ulong = 0x4004_6517;
const ENABLE_MC_TRIGGER: libc::c_ulong = 0x0000_6518;
const ENABLE_SC_TRIGGER: libc::c_ulong = 0x0000_6519;

const MC_TRIGGER_SOURCE: libc::c_ulong = 1 << 6;
const SC_TRIGGER_SOURCE: libc::c_ulong = 1 << 5;

/// Shared handle on the event device node.
pub struct EventDevice {
    file: File,
}

impl EventDevice {
    pub fn open(path: &Path) -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            file: File::open(path)?,
        }))
    }

    fn ioctl_value(&self, request: libc::c_ulong, value: libc::c_ulong) -> io::Result<()> {
        // SAFETY: the request takes its argument by value.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, value) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ioctl_ref<T>(&self, request: libc::c_ulong, value: &mut T) -> io::Result<()> {
        // SAFETY: `value` is a valid object of the type the request
        // expects, live for the duration of the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, value as *mut T) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocking trigger read. `Ok(None)` on the driver's 100 ms timeout.
    fn read_trigger(&self, request: libc::c_ulong) -> io::Result<Option<i64>> {
        let mut time: i64 = 0;
        match self.ioctl_ref(request, &mut time) {
            Ok(()) => Ok(Some(time)),
            // Almost certainly the trigger isn't connected.
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn log_failure(&self, what: &str, result: io::Result<()>) {
        if let Err(e) = result {
            log::error!("event device: {} failed: {}", what, e);
        }
    }
}

/// Machine-clock side of the device.
pub struct MachineClockIo {
    device: Arc<EventDevice>,
}

impl MachineClockIo {
    pub fn new(device: Arc<EventDevice>) -> io::Result<Self> {
        device.ioctl_value(ENABLE_MC_TRIGGER, MC_TRIGGER_SOURCE)?;
        Ok(Self { device })
    }
}

impl ClockSource for MachineClockIo {
    fn read(&self) -> io::Result<Option<i64>> {
        self.device.read_trigger(GET_MC_TRIGGER)
    }

    fn set_dac(&self, dac: u16) {
        let result = self.device.ioctl_value(SET_DAC_A, dac as libc::c_ulong);
        self.device.log_failure("set machine DAC", result);
    }

    fn notify(&self, advance: i64, phase: i64, locked: bool) {
        // The driver wants the frequency in hundredths of a clock.
        let mut frequency = (100 * advance) as libc::c_ulong;
        let mut phase = phase;
        let mut locked = locked as libc::c_uint;
        let d = &self.device;
        d.log_failure("set MC frequency", d.ioctl_ref(SET_MC_FREQUENCY, &mut frequency));
        d.log_failure("set MC phase", d.ioctl_ref(SET_MC_PHASE, &mut phase));
        d.log_failure("set MC lock flag", d.ioctl_ref(SET_MC_LOCKED, &mut locked));
    }

    fn set_nco(&self, word: u32) {
        let mut word = word;
        let result = self.device.ioctl_ref(SET_NCO, &mut word);
        self.device.log_failure("set NCO", result);
    }
}

/// System-clock side of the device.
pub struct SystemClockIo {
    device: Arc<EventDevice>,
}

impl SystemClockIo {
    pub fn new(device: Arc<EventDevice>) -> io::Result<Self> {
        device.ioctl_value(ENABLE_SC_TRIGGER, SC_TRIGGER_SOURCE)?;
        Ok(Self { device })
    }
}

impl ClockSource for SystemClockIo {
    fn read(&self) -> io::Result<Option<i64>> {
        self.device.read_trigger(GET_SC_TRIGGER)
    }

    fn set_dac(&self, dac: u16) {
        let result = self.device.ioctl_value(SET_DAC_B, dac as libc::c_ulong);
        self.device.log_failure("set system DAC", result);
    }

    fn notify(&self, _advance: i64, phase: i64, locked: bool) {
        let mut phase = phase;
        let mut locked = locked as libc::c_uint;
        let d = &self.device;
        d.log_failure("set SC phase", d.ioctl_ref(SET_SC_PHASE, &mut phase));
        d.log_failure("set SC lock flag", d.ioctl_ref(SET_SC_LOCKED, &mut locked));
    }
}
