// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-backed acquisition and register access.
//!
//! The conditioning registers live in a memory-mapped window of the
//! FPGA's address space; the demodulated and raw sample streams are read
//! from their device nodes as packed little-endian records.

use bpmd::dsc::registers::{arm_snapshot_trigger, poll_snapshot_trigger};
use bpmd::hw::{AdcAtom, AdcSource, AdcTrigger, RegisterBus, TbtAtom, TbtSource};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Base of the conditioning register window in physical memory.
const REGISTER_BASE: i64 = 0x1400_0000;
const MAP_SIZE: usize = 0x1_0000;
const MAP_MASK: u32 = (MAP_SIZE - 1) as u32;

/// Memory-mapped register window over `/dev/mem`.
pub struct MmapBus {
    base: *mut u32,
    // Keeps the mapping alive.
    _file: File,
}

// SAFETY: the mapping is private to this process and every access goes
// through volatile reads/writes of aligned 32-bit cells.
unsafe impl Send for MmapBus {}
unsafe impl Sync for MmapBus {}

impl MmapBus {
    pub fn open(path: &Path) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: mapping a fresh region; the fd stays open for the
        // lifetime of the mapping.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                REGISTER_BASE,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Arc::new(Self {
            base: base.cast(),
            _file: file,
        }))
    }
}

impl Drop for MmapBus {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `open`.
        unsafe {
            libc::munmap(self.base.cast(), MAP_SIZE);
        }
    }
}

impl RegisterBus for MmapBus {
    fn write(&self, offset: u32, value: u32) {
        let at = (offset & MAP_MASK) as usize / 4;
        // SAFETY: `at` is inside the mapped window and 4-byte aligned.
        unsafe { self.base.add(at).write_volatile(value) }
    }

    fn read(&self, offset: u32) -> u32 {
        let at = (offset & MAP_MASK) as usize / 4;
        // SAFETY: as for `write`.
        unsafe { self.base.add(at).read_volatile() }
    }
}

/// Demodulated turn-by-turn stream: 8 little-endian i32 words per atom
/// (cos/sin per channel).
pub struct TbtDevice {
    file: Mutex<File>,
}

impl TbtDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::open(path)?),
        })
    }
}

impl TbtSource for TbtDevice {
    fn acquire(&self, atoms: usize, out: &mut Vec<TbtAtom>) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; atoms * 32];
        let mut filled = 0;
        while filled < raw.len() {
            match file.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        out.clear();
        for record in raw[..filled - filled % 32].chunks_exact(32) {
            let word =
                |at: usize| i32::from_le_bytes(record[at * 4..at * 4 + 4].try_into().unwrap());
            out.push(TbtAtom {
                cos: [word(0), word(2), word(4), word(6)],
                sin: [word(1), word(3), word(5), word(7)],
            });
        }
        Ok(out.len())
    }
}

/// ADC-rate snapshot buffer: 4 little-endian i16 words per atom. Arming
/// and trigger polling go through the register window.
pub struct AdcDevice {
    file: Mutex<File>,
    bus: Arc<MmapBus>,
}

impl AdcDevice {
    pub fn open(path: &Path, bus: Arc<MmapBus>) -> io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::open(path)?),
            bus,
        })
    }
}

impl AdcSource for AdcDevice {
    fn arm(&self, position: u32, delay: u32, trigger: AdcTrigger, forced: bool) -> io::Result<()> {
        arm_snapshot_trigger(&self.bus, position, delay, trigger, forced)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn wait_trigger(&self, timeout: Duration) -> io::Result<bool> {
        Ok(poll_snapshot_trigger(&self.bus, timeout))
    }

    fn read(&self, atoms: usize, out: &mut Vec<AdcAtom>) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; atoms * 8];
        let mut filled = 0;
        while filled < raw.len() {
            match file.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        out.clear();
        for record in raw[..filled - filled % 8].chunks_exact(8) {
            let word =
                |at: usize| i16::from_le_bytes(record[at * 2..at * 2 + 2].try_into().unwrap());
            out.push(AdcAtom {
                ch: [word(0), word(1), word(2), word(3)],
            });
        }
        Ok(out.len())
    }
}
