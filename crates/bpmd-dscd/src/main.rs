// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal-conditioning daemon.
//!
//! Runs the compensation engine on its three-second tick and serves
//! client requests (AGC/DSC/gain/switch get-set) arriving on the request
//! FIFO. Replies go to the per-client FIFO `/tmp/<pid>.fifo`.
//!
//! # Usage
//!
//! ```bash
//! bpmd-dscd --gain-table /opt/dsc/gain.conf
//!
//! # Bench test without the instrument:
//! bpmd-dscd --gain-table etc/gain.conf --sim
//! ```

mod device;

use anyhow::{Context, Result};
use bpmd::dsc::engine::TICK_PERIOD;
use bpmd::dsc::protocol::{Request, REQUEST_BYTES};
use bpmd::dsc::{AcqGeometry, AttenuatorSchedule, DscEngine, EngineConfig};
use bpmd::hw::sim::{MemBus, SimAdc, SimTbt};
use bpmd::hw::RegisterBus;
use bpmd::{PidFile, Shutdown};
use clap::Parser;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpmd-dscd")]
#[command(author = "naskel.com")]
#[command(version = bpmd::VERSION)]
#[command(about = "Signal-conditioning daemon for the BPM instrument")]
struct Cli {
    /// Decimation factor (sampling frequency to turn-by-turn rate).
    #[arg(short = 'd', long, default_value = "220")]
    decimation: usize,

    /// Revolution frequency in Hz.
    #[arg(short = 'f', long, default_value = "533818.3761")]
    revolution_frequency: f64,

    /// Turn-by-turn samples per switch position.
    #[arg(short = 'n', long, default_value = "40")]
    samples_per_position: usize,

    /// Harmonic number (RF frequency to turn-by-turn rate).
    #[arg(short = 'r', long, default_value = "936")]
    harmonic: usize,

    /// ADC-rate buffer peak level at 0 dBm, in ADC counts.
    #[arg(short = 'a', long, default_value = "1228")]
    adc_peak_0dbm: f64,

    /// Sum of attenuators at 0 dBm, in dB.
    #[arg(short = 's', long, default_value = "44")]
    attenuator_sum_0dbm: i32,

    /// Marker delay in ADC samples.
    #[arg(short = 'm', long, default_value = "440")]
    marker_delay: u32,

    /// Analog-to-digital switch propagation delay in ADC samples.
    #[arg(short = 't', long, default_value = "40")]
    a2d_delay: u32,

    /// Averaging in phase compensation, in switching periods.
    #[arg(short = 'g', long, default_value = "10")]
    phase_averaging: usize,

    /// Machine-clock tune offset.
    #[arg(short = 'o', long, default_value = "0")]
    tune_offset: i64,

    /// Machine-clock prescaler of the PLL daemon.
    #[arg(short = 'p', long, default_value = "53382")]
    mc_prescale: i64,

    /// Attenuator schedule file.
    #[arg(long, default_value = "/opt/dsc/gain.conf")]
    gain_table: PathBuf,

    /// Volatile (RAM-backed) coefficient snapshot.
    #[arg(long, default_value = "/tmp/dsc_lastgood.dat")]
    volatile_store: PathBuf,

    /// Last-good (flash-backed) coefficient snapshot.
    #[arg(long, default_value = "/opt/dsc/lastgood.dat")]
    lastgood_store: PathBuf,

    /// Mount point remounted read-write around last-good saves.
    #[arg(long, default_value = "/opt")]
    lastgood_remount: PathBuf,

    /// Request FIFO (created if absent).
    #[arg(long, default_value = "/tmp/bpmd-dsc.fifo")]
    request_fifo: PathBuf,

    /// PID file.
    #[arg(long, default_value = "/var/run/bpmd-dscd.pid")]
    pid_file: PathBuf,

    /// Turn-by-turn data device.
    #[arg(long, default_value = "/dev/bpm.dd")]
    dd_device: PathBuf,

    /// ADC-rate data device.
    #[arg(long, default_value = "/dev/bpm.adc")]
    adc_device: PathBuf,

    /// Register window device.
    #[arg(long, default_value = "/dev/mem")]
    register_device: PathBuf,

    /// Run against simulated hardware (no device nodes needed).
    #[arg(long)]
    sim: bool,
}

impl Cli {
    fn geometry(&self) -> AcqGeometry {
        AcqGeometry {
            decimation: self.decimation,
            f_tbt: self.revolution_frequency,
            n_tbt: self.samples_per_position,
            harmonic: self.harmonic,
            adc_peak_0dbm: self.adc_peak_0dbm,
            attn_sum_0dbm: self.attenuator_sum_0dbm,
            marker_delay: self.marker_delay,
            a2d_delay: self.a2d_delay,
            ph_avg: self.phase_averaging,
            tune_offset: self.tune_offset,
            mc_prescale: self.mc_prescale,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let _pid = PidFile::acquire(&cli.pid_file).context("acquiring pid file")?;
    bpmd::runtime::create_fifo(&cli.request_fifo).context("creating request fifo")?;

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.request()).context("installing signal handler")?;
    }

    // Operation without a proper attenuator schedule is not allowed.
    let schedule = AttenuatorSchedule::load(&cli.gain_table)
        .with_context(|| format!("loading {}", cli.gain_table.display()))?;
    let geometry = cli.geometry();
    let config = EngineConfig {
        geometry: geometry.clone(),
        volatile_store: cli.volatile_store.clone(),
        lastgood_store: cli.lastgood_store.clone(),
        lastgood_remount: Some(cli.lastgood_remount.clone()),
    };

    let result = if cli.sim {
        let angle_step = 2.0 * std::f64::consts::PI * geometry.f_if() / geometry.f_samp();
        let engine = DscEngine::new(
            config,
            schedule,
            MemBus::new(),
            Box::new(SimTbt::new(geometry.n_tbt)),
            Box::new(SimAdc::new(angle_step, [800.0; 4])),
        )
        .context("initialising compensation engine")?;
        serve(&cli, engine, &shutdown)
    } else {
        let bus = device::MmapBus::open(&cli.register_device)
            .with_context(|| format!("mapping {}", cli.register_device.display()))?;
        let tbt = device::TbtDevice::open(&cli.dd_device)
            .with_context(|| format!("opening {}", cli.dd_device.display()))?;
        let adc = device::AdcDevice::open(&cli.adc_device, Arc::clone(&bus))
            .with_context(|| format!("opening {}", cli.adc_device.display()))?;
        let engine = DscEngine::new(config, schedule, bus, Box::new(tbt), Box::new(adc))
            .context("initialising compensation engine")?;
        serve(&cli, engine, &shutdown)
    };

    let _ = std::fs::remove_file(&cli.request_fifo);
    result
}

/// The daemon loop: compensation ticks interleaved with client requests.
fn serve<B: RegisterBus>(
    cli: &Cli,
    mut engine: DscEngine<B>,
    shutdown: &Shutdown,
) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&cli.request_fifo)
        .with_context(|| format!("opening {}", cli.request_fifo.display()))?;
    // Hold a write end ourselves so the read side never sees end-of-file
    // when a client disconnects.
    let _writer_keepalive = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&cli.request_fifo)?;

    log::info!("bpmd-dscd configured -- resuming normal operations");

    let mut record = [0u8; REQUEST_BYTES];
    let mut filled = 0usize;
    let mut next_tick = Instant::now() + TICK_PERIOD;

    while !shutdown.is_set() {
        // Attempt to complete the next request record.
        match fifo.read(&mut record[filled..]) {
            Ok(0) => {
                shutdown.wait_timeout(Duration::from_millis(50));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(Duration::from_millis(50));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("reading request fifo"),
        }
        if filled == REQUEST_BYTES {
            filled = 0;
            match Request::decode(&record) {
                Ok(mut request) => {
                    engine.handle_request(&mut request);
                    reply(&request);
                }
                Err(e) => log::error!("cannot handle request: {}", e),
            }
        }

        if Instant::now() >= next_tick {
            next_tick += TICK_PERIOD;
            if let Err(e) = engine.tick() {
                log::error!("compensation tick failed: {}", e);
            }
        }
    }

    engine.shutdown();
    Ok(())
}

/// Write the reply record to the client's FIFO.
fn reply(request: &Request) {
    let path = request.reply_path();
    let opened = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path);
    match opened {
        Ok(mut fifo) => {
            if let Err(e) = fifo.write_all(&request.encode()) {
                log::error!("{}: {}", path.display(), e);
            }
        }
        Err(e) => log::error!("cannot open {}: {}", path.display(), e),
    }
}
