// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event device access: the blocking event stream plus the two
//! clock-setting controls used by the synchronisation supervisor.

use bpmd::hw::{EventSource, RawEvent};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

const SET_SC_TIME: libc::c_ulong = 0x4010_6520;
const SET_MC_TIME: libc::c_ulong = 0x0000_6521;
const SET_EVENT_MASK: libc::c_ulong = 0x4004_6522;

/// The event device node. Reads block until the next hardware event.
pub struct EventDevice {
    file: parking_lot::Mutex<File>,
}

impl EventDevice {
    pub fn open(path: &Path) -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            file: parking_lot::Mutex::new(File::open(path)?),
        }))
    }

    fn ioctl_ref<T>(&self, request: libc::c_ulong, value: &mut T) -> io::Result<()> {
        let fd = self.file.lock().as_raw_fd();
        // SAFETY: `value` is a valid object of the type the request
        // expects, live for the duration of the call.
        let rc = unsafe { libc::ioctl(fd, request as _, value as *mut T) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ioctl_value(&self, request: libc::c_ulong, value: libc::c_ulong) -> io::Result<()> {
        let fd = self.file.lock().as_raw_fd();
        // SAFETY: the request takes its argument by value.
        let rc = unsafe { libc::ioctl(fd, request as _, value) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Program the moment the next system-clock trigger is expected.
    pub fn set_system_clock_time(&self, time: SystemTime) -> io::Result<()> {
        let since_epoch = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "time before epoch"))?;
        let mut spec = libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        };
        self.ioctl_ref(SET_SC_TIME, &mut spec)
    }

    /// Zero the machine clock at the next synchronisation trigger.
    pub fn set_machine_clock_time(&self) -> io::Result<()> {
        self.ioctl_value(SET_MC_TIME, 0)
    }
}

/// Newtype over `Arc<EventDevice>` so the foreign `EventSource` trait can
/// be implemented here: `impl ForeignTrait for Arc<LocalType>` is blocked
/// by the orphan rules since `Arc` itself isn't local to this crate.
pub struct EventDeviceSource(pub Arc<EventDevice>);

impl EventSource for EventDeviceSource {
    fn set_mask(&self, mask: u32) -> io::Result<()> {
        self.0.ioctl_value(SET_EVENT_MASK, mask as libc::c_ulong)
    }

    fn next_event(&self) -> io::Result<Option<RawEvent>> {
        // One packed record per event: id word then parameter word.
        let mut record = [0u8; 8];
        let mut file = self.0.file.lock();
        match file.read(&mut record) {
            Ok(8) => Ok(Some(RawEvent {
                id: u32::from_le_bytes(record[0..4].try_into().unwrap()),
                param: i32::from_le_bytes(record[4..8].try_into().unwrap()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}
