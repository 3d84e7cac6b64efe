// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock PLL daemon.
//!
//! Runs the machine-clock and system-clock servos and exposes the command
//! and status FIFOs. Everything beyond the few startup options is
//! controlled through the command pipe, one line per command:
//! `m...` machine clock, `s...` system clock, `n<offset>` intermediate
//! frequency NCO.
//!
//! # Usage
//!
//! ```bash
//! bpmd-clockd --prescale 84663 --decimation 129 --harmonic 936
//!
//! # Bench test without the instrument:
//! bpmd-clockd -p 84663 -d 129 -r 936 --sim
//! ```

mod device;

use anyhow::{bail, Context, Result};
use bpmd::hw::{sim::SimClock, ClockSource};
use bpmd::persistent::{Persistent, StateStore};
use bpmd::pll::{
    machine_clock_config, machine_clock_stages, system_clock_config, system_clock_stages,
};
use bpmd::{Controller, PidFile, Shutdown, StatusWriter};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpmd-clockd")]
#[command(author = "naskel.com")]
#[command(version = bpmd::VERSION)]
#[command(about = "Clock PLL daemon for the BPM instrument")]
struct Cli {
    /// Machine-clock prescaler: machine clocks between trigger events.
    #[arg(short = 'p', long)]
    prescale: i64,

    /// Decimation: samples per revolution.
    #[arg(short = 'd', long)]
    decimation: i64,

    /// Harmonic number: bunches per revolution.
    #[arg(short = 'r', long)]
    harmonic: i64,

    /// Event device node.
    #[arg(long, default_value = "/dev/bpm.event")]
    device: PathBuf,

    /// Command FIFO (created if absent).
    #[arg(long, default_value = "/tmp/bpmd-clock.command")]
    command_fifo: PathBuf,

    /// Status FIFO (created if absent).
    #[arg(long, default_value = "/tmp/bpmd-clock.status")]
    status_fifo: PathBuf,

    /// PID file.
    #[arg(long, default_value = "/var/run/bpmd-clockd.pid")]
    pid_file: PathBuf,

    /// Persistent state file holding the programmed offsets.
    #[arg(long, default_value = "/opt/bpm/clockd.state")]
    state_file: PathBuf,

    /// Seconds between persistent-state change polls.
    #[arg(long, default_value = "1000")]
    state_poll: u64,

    /// Run against simulated hardware (no device node needed).
    #[arg(long)]
    sim: bool,
}

/// Offsets mirrored into the persistent state file, so a daemon restart
/// resumes with the operator's last settings.
struct SavedTuning {
    mc_frequency: Persistent<i32>,
    mc_phase: Persistent<i32>,
    sc_frequency: Persistent<i32>,
    sc_phase: Persistent<i32>,
    nco_offset: Persistent<i32>,
}

impl SavedTuning {
    fn register(store: &StateStore) -> Self {
        Self {
            mc_frequency: store.register("mc_frequency_offset", 0),
            mc_phase: store.register("mc_phase_offset", 0),
            sc_frequency: store.register("sc_frequency_offset", 0),
            sc_phase: store.register("sc_phase_offset", 0),
            nco_offset: store.register("nco_offset", 0),
        }
    }

    /// Record a command line that changes a persistent offset.
    fn observe(&self, line: &str) {
        let mut chars = line.chars();
        let Some(prefix) = chars.next() else { return };
        if prefix == 'n' {
            if let Ok(value) = chars.as_str().trim().parse() {
                self.nco_offset.set(value);
            }
            return;
        }
        let Some(op) = chars.next() else { return };
        let Ok(value) = chars.as_str().trim().parse::<i32>() else {
            return;
        };
        match (prefix, op) {
            ('m', 'o') => self.mc_frequency.set(value),
            ('m', 'p') => self.mc_phase.set(value),
            ('s', 'o') => self.sc_frequency.set(value),
            ('s', 'p') => self.sc_phase.set(value),
            _ => {}
        }
    }
}

/// Intermediate-frequency NCO phase-advance word `2^32·frac(f_rf/f_s)`.
///
/// With P the machine-clock prescaler, D the decimation, H the harmonic
/// number and F the NCO offset, the sample clock is
/// `f_s = (D/H + F/(H·P))·f_rf`, and as the offset is small the integer
/// part of `H·P/(P·D+F)` is the integer part of `H/D`.
fn nco_word(harmonic: i64, prescale: i64, decimation: i64, offset: i64) -> u32 {
    let fractional = (harmonic * prescale) as f64 / (prescale * decimation + offset) as f64
        - (harmonic / decimation) as f64;
    ((1u64 << 32) as f64 * fractional) as u32
}

/// Open the status FIFO for writing without blocking on a reader: the
/// read side is opened first (and kept, so the write side stays usable
/// with no client attached).
fn open_status_fifo(path: &Path) -> Result<(File, File)> {
    let reader = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening {} for read", path.display()))?;
    let writer = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening {} for write", path.display()))?;
    Ok((reader, writer))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.prescale == 0 || cli.decimation == 0 || cli.harmonic == 0 {
        bail!("prescale, decimation and harmonic must all be non-zero");
    }

    let _pid = PidFile::acquire(&cli.pid_file).context("acquiring pid file")?;
    bpmd::runtime::create_fifo(&cli.command_fifo).context("creating command fifo")?;
    bpmd::runtime::create_fifo(&cli.status_fifo).context("creating status fifo")?;

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.request()).context("installing signal handler")?;
    }

    let result = if cli.sim {
        let machine = SimClock::new(cli.prescale * cli.decimation, 0.03, |_| 0.0);
        let system = SimClock::new(12_500_000, 0.03, |_| 0.0);
        machine.set_tick_pause(Duration::from_millis(10));
        system.set_tick_pause(Duration::from_millis(100));
        run(&cli, machine, system, shutdown)
    } else {
        let device = device::EventDevice::open(&cli.device)
            .with_context(|| format!("opening {}", cli.device.display()))?;
        let machine = Arc::new(
            device::MachineClockIo::new(Arc::clone(&device))
                .context("enabling machine clock triggers")?,
        );
        let system = Arc::new(
            device::SystemClockIo::new(device).context("enabling system clock triggers")?,
        );
        run(&cli, machine, system, shutdown)
    };

    let _ = std::fs::remove_file(&cli.command_fifo);
    let _ = std::fs::remove_file(&cli.status_fifo);
    result
}

fn run<M, S>(
    cli: &Cli,
    machine_io: Arc<M>,
    system_io: Arc<S>,
    shutdown: Arc<Shutdown>,
) -> Result<()>
where
    M: ClockSource + 'static,
    S: ClockSource + 'static,
{
    let (_status_reader, status_writer) = open_status_fifo(&cli.status_fifo)?;
    let status = Arc::new(StatusWriter::new(Box::new(status_writer)));

    let machine = Controller::new(
        machine_clock_config(cli.prescale * cli.decimation),
        machine_clock_stages(),
        Arc::clone(&machine_io),
        Arc::clone(&status),
        Arc::clone(&shutdown),
    );
    let system = Controller::new(
        system_clock_config(),
        system_clock_stages(),
        system_io,
        status,
        Arc::clone(&shutdown),
    );

    // Restore the operator's last offsets, then program the NCO to the
    // selected machine clock frequency before the servos start moving
    // anything.
    let state = StateStore::new(&cli.state_file, None);
    let saved = SavedTuning::register(&state);
    machine.command(&format!("o{}", saved.mc_frequency.get()));
    machine.command(&format!("p{}", saved.mc_phase.get()));
    system.command(&format!("o{}", saved.sc_frequency.get()));
    system.command(&format!("p{}", saved.sc_phase.get()));
    machine_io.set_nco(nco_word(
        cli.harmonic,
        cli.prescale,
        cli.decimation,
        saved.nco_offset.get() as i64,
    ));

    let machine_thread = machine.spawn().context("spawning machine clock servo")?;
    let system_thread = system.spawn().context("spawning system clock servo")?;
    let state_thread = state
        .spawn_poller(Duration::from_secs(cli.state_poll), Arc::clone(&shutdown))
        .context("spawning state poller")?;
    log::info!("clock servos running");

    command_loop(cli, &machine, &system, &machine_io, &saved, &shutdown)?;

    machine_thread.join().ok();
    system_thread.join().ok();
    state_thread.join().ok();
    Ok(())
}

/// Read the command FIFO until shutdown, dispatching one line at a time.
fn command_loop<M, S>(
    cli: &Cli,
    machine: &Controller<Arc<M>>,
    system: &Controller<Arc<S>>,
    machine_io: &Arc<M>,
    saved: &SavedTuning,
    shutdown: &Shutdown,
) -> Result<()>
where
    M: ClockSource + 'static,
    S: ClockSource + 'static,
{
    let mut fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&cli.command_fifo)
        .with_context(|| format!("opening {}", cli.command_fifo.display()))?;

    let mut pending = String::new();
    let mut chunk = [0u8; 256];
    while !shutdown.is_set() {
        match fifo.read(&mut chunk) {
            Ok(0) => {
                // No writer attached right now.
                shutdown.wait_timeout(Duration::from_millis(100));
            }
            Ok(n) => {
                pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
                while let Some(at) = pending.find('\n') {
                    let line: String = pending.drain(..=at).collect();
                    let line = line.trim_end_matches('\n');
                    dispatch(line, machine, system, machine_io, cli);
                    saved.observe(line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(Duration::from_millis(50));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("reading command fifo"),
        }
    }
    Ok(())
}

fn dispatch<M, S>(
    line: &str,
    machine: &Controller<Arc<M>>,
    system: &Controller<Arc<S>>,
    machine_io: &Arc<M>,
    cli: &Cli,
) where
    M: ClockSource + 'static,
    S: ClockSource + 'static,
{
    let mut chars = line.chars();
    match chars.next() {
        Some('m') => machine.command(chars.as_str()),
        Some('s') => system.command(chars.as_str()),
        Some('n') => {
            let offset = chars.as_str().trim().parse::<i64>().unwrap_or(0);
            machine_io.set_nco(nco_word(cli.harmonic, cli.prescale, cli.decimation, offset));
        }
        _ => log::error!("unknown command \"{}\"", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nco_word_matches_reference_setup() {
        // 936 bunches, 220 samples per turn: frac(H/D) = 936/220 - 4.
        let word = nco_word(936, 53382, 220, 0);
        let expect = ((1u64 << 32) as f64 * (936.0 / 220.0 - 4.0)) as u32;
        let delta = word.abs_diff(expect);
        assert!(delta < 1 << 12, "word {:#x} expect {:#x}", word, expect);
    }

    #[test]
    fn nco_offset_moves_the_word_down() {
        let nominal = nco_word(936, 53382, 220, 0);
        let detuned = nco_word(936, 53382, 220, 1000);
        assert!(detuned < nominal);
    }
}
