// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event fan-out daemon.
//!
//! Receives hardware trigger events and dispatches them to the consumer
//! chain (postmortem, interlock, clock synchronisation, tick, mean sums)
//! with bounded-latency observer handshakes. Also hosts the clock
//! synchronisation supervisor and the PLL status monitor, wired to the
//! clock daemon's FIFOs.
//!
//! Operator requests arrive on the control FIFO, one keyword per line:
//! `sync-mc` and `sync-sc` arm machine/system clock synchronisation,
//! `report` logs a one-shot summary of the dispatch counters.

mod consumers;
mod device;
mod monitor;
mod sync;

use anyhow::{Context, Result};
use bpmd::events::{DispatcherBuilder, EventId, Priority};
use bpmd::hw::sim::SimEvents;
use bpmd::sync::OnceSignal;
use bpmd::{PidFile, Shutdown};
use clap::Parser;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpmd-eventd")]
#[command(author = "naskel.com")]
#[command(version = bpmd::VERSION)]
#[command(about = "Event fan-out daemon for the BPM instrument")]
struct Cli {
    /// Event device node.
    #[arg(long, default_value = "/dev/bpm.event")]
    device: PathBuf,

    /// Clock daemon command FIFO (written for synchronisation).
    #[arg(long, default_value = "/tmp/bpmd-clock.command")]
    clock_command_fifo: PathBuf,

    /// Clock daemon status FIFO (followed by the monitor).
    #[arg(long, default_value = "/tmp/bpmd-clock.status")]
    clock_status_fifo: PathBuf,

    /// Control FIFO (created if absent).
    #[arg(long, default_value = "/tmp/bpmd-event.control")]
    control_fifo: PathBuf,

    /// PID file.
    #[arg(long, default_value = "/var/run/bpmd-eventd.pid")]
    pid_file: PathBuf,

    /// Run against simulated hardware: synthetic triggers at 1 Hz.
    #[arg(long)]
    sim: bool,
}

/// Clock setter used in sim mode.
struct NullSetter;

impl sync::ClockSetter for NullSetter {
    fn set_system_clock_time(&self, _time: std::time::SystemTime) {
        log::debug!("sim: system clock trigger time armed");
    }
    fn set_machine_clock_time(&self) {
        log::debug!("sim: machine clock zeroed at next trigger");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let _pid = PidFile::acquire(&cli.pid_file).context("acquiring pid file")?;
    bpmd::runtime::create_fifo(&cli.control_fifo).context("creating control fifo")?;

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.request()).context("installing signal handler")?;
    }

    // The observer-ready broadcast: set exactly once, after the consumer
    // chain is fully wired.
    let observer_ready = Arc::new(OnceSignal::new());
    let clock_monitor = monitor::ClockMonitor::new();

    let postmortem = consumers::PostmortemConsumer::new(&observer_ready);
    let interlock = consumers::InterlockConsumer::new(&observer_ready);
    let tick = consumers::TickConsumer::new(&observer_ready, Arc::clone(&clock_monitor));
    let mean_sums = consumers::MeanSumsConsumer::new(&observer_ready);

    let event_device = if cli.sim {
        None
    } else {
        Some(
            device::EventDevice::open(&cli.device)
                .with_context(|| format!("opening {}", cli.device.display()))?,
        )
    };

    let pll = sync::PllCommander::new(&cli.clock_command_fifo);
    let setter: Arc<dyn sync::ClockSetter> = match &event_device {
        Some(device) => Arc::new(Arc::clone(device)),
        None => Arc::new(NullSetter),
    };
    let supervisor = sync::SyncSupervisor::new(pll, setter);

    let dispatcher = DispatcherBuilder::new()
        .enable_event(EventId::Trigger)
        .enable_event(EventId::SyncSet)
        .enable_event(EventId::Postmortem)
        .enable_event(EventId::Interlock)
        .register(EventId::Postmortem, Priority::Postmortem, Arc::clone(&postmortem) as _)
        .register(EventId::Interlock, Priority::Interlock, Arc::clone(&interlock) as _)
        .register(EventId::SyncSet, Priority::Sync, Arc::clone(&supervisor) as _)
        .register(EventId::Trigger, Priority::Tick, Arc::clone(&tick) as _)
        .register(EventId::Trigger, Priority::MeanSums, Arc::clone(&mean_sums) as _)
        .build();

    let mut threads = Vec::new();
    threads.push(dispatcher.spawn(Arc::clone(&shutdown))?);
    threads.push(clock_monitor.spawn(&cli.clock_status_fifo, Arc::clone(&shutdown))?);
    threads.push(supervisor.spawn(Arc::clone(&shutdown))?);

    if cli.sim {
        let events = SimEvents::new();
        threads.push(bpmd::events::spawn_receiver(
            Arc::clone(&events),
            Arc::clone(&dispatcher),
            Arc::clone(&shutdown),
        )?);
        // Synthetic 1 Hz machine triggers for bench testing.
        let feeder_shutdown = Arc::clone(&shutdown);
        threads.push(std::thread::Builder::new().name("sim-trigger".into()).spawn(
            move || {
                while !feeder_shutdown.wait_timeout(Duration::from_secs(1)) {
                    events.push(EventId::Trigger.mask(), 0);
                }
            },
        )?);
    } else if let Some(source) = event_device {
        threads.push(bpmd::events::spawn_receiver(
            device::EventDeviceSource(source),
            Arc::clone(&dispatcher),
            Arc::clone(&shutdown),
        )?);
    }

    // Everything is wired: release the consumers' first waits.
    observer_ready.set();
    log::info!("event dispatch running");

    let report = Report {
        postmortem,
        interlock,
        tick,
        mean_sums,
        monitor: clock_monitor,
    };
    control_loop(&cli, &supervisor, &report, &shutdown)?;

    for thread in threads {
        thread.join().ok();
    }
    let _ = std::fs::remove_file(&cli.control_fifo);
    Ok(())
}

/// Everything the `report` keyword surfaces to the log.
struct Report {
    postmortem: Arc<consumers::PostmortemConsumer>,
    interlock: Arc<consumers::InterlockConsumer>,
    tick: Arc<consumers::TickConsumer>,
    mean_sums: Arc<consumers::MeanSumsConsumer>,
    monitor: Arc<monitor::ClockMonitor>,
}

impl Report {
    fn log(&self) {
        let machine = self.monitor.machine();
        let system = self.monitor.system();
        log::info!(
            "MC stage {} sync {:?} | SC stage {} sync {:?}",
            machine.stage,
            machine.sync,
            system.stage,
            system.sync
        );
        log::info!(
            "ticks {} | mean-sums events {} (sum {}) | pm missed {} | last interlock reason {:#x}",
            self.tick.ticks(),
            self.mean_sums.events(),
            self.mean_sums.sum(),
            self.postmortem.missed(),
            self.interlock.reason()
        );
    }
}

/// Read operator keywords from the control FIFO until shutdown.
fn control_loop(
    cli: &Cli,
    supervisor: &Arc<sync::SyncSupervisor>,
    report: &Report,
    shutdown: &Shutdown,
) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&cli.control_fifo)
        .with_context(|| format!("opening {}", cli.control_fifo.display()))?;

    let mut pending = String::new();
    let mut chunk = [0u8; 128];
    while !shutdown.is_set() {
        match fifo.read(&mut chunk) {
            Ok(0) => {
                shutdown.wait_timeout(Duration::from_millis(100));
            }
            Ok(n) => {
                pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
                while let Some(at) = pending.find('\n') {
                    let line: String = pending.drain(..=at).collect();
                    match line.trim() {
                        "sync-mc" => supervisor.synchronise_machine_clock(),
                        "sync-sc" => supervisor.synchronise_system_clock(),
                        "report" => report.log(),
                        "" => {}
                        other => log::error!("unknown control request \"{}\"", other),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(Duration::from_millis(50));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("reading control fifo"),
        }
    }
    Ok(())
}
