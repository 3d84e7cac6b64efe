// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operator CLI for the BPM instrument daemons.
//!
//! # Usage
//!
//! ```bash
//! # Clock servo commands
//! bpmdctl clock mc offset -150
//! bpmdctl clock sc verbose 1
//! bpmdctl nco 20
//!
//! # Signal conditioning
//! bpmdctl dsc mode set auto
//! bpmdctl dsc gain get
//! bpmdctl dsc save-lastgood
//!
//! # Clock synchronisation and status
//! bpmdctl sync mc
//! bpmdctl status --lines 10
//! ```

use anyhow::{bail, Context, Result};
use bpmd::dsc::protocol::{self, Request, RequestKind, REQUEST_BYTES};
use bpmd::pll::{parse_status_line, StatusLine};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "bpmdctl")]
#[command(author = "naskel.com")]
#[command(version = bpmd::VERSION)]
#[command(about = "Operator CLI for the BPM instrument daemons")]
struct Cli {
    /// Clock daemon command FIFO.
    #[arg(long, default_value = "/tmp/bpmd-clock.command")]
    clock_fifo: PathBuf,

    /// Clock daemon status FIFO.
    #[arg(long, default_value = "/tmp/bpmd-clock.status")]
    status_fifo: PathBuf,

    /// Conditioning daemon request FIFO.
    #[arg(long, default_value = "/tmp/bpmd-dsc.fifo")]
    dsc_fifo: PathBuf,

    /// Event daemon control FIFO.
    #[arg(long, default_value = "/tmp/bpmd-event.control")]
    event_fifo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClockTarget {
    Mc,
    Sc,
}

impl ClockTarget {
    fn prefix(self) -> char {
        match self {
            ClockTarget::Mc => 'm',
            ClockTarget::Sc => 's',
        }
    }
}

#[derive(Subcommand)]
enum ClockCommand {
    /// Set the frequency offset (detune).
    Offset { value: i32 },
    /// Set the phase offset relative to the synchronisation point.
    Phase { value: i32 },
    /// Set the synchronisation state (0 none, 1 tracking, 2 synchronised).
    Sync { value: i32 },
    /// Enable or disable verbose status reports.
    Verbose { value: i32 },
    /// Set the status report interval in ticks.
    Interval { value: i32 },
    /// Open or close the servo loop.
    OpenLoop { value: i32 },
    /// Write the DAC directly (open loop only).
    Dac { value: i32 },
    /// Send a raw command line (without the clock prefix).
    Raw { line: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum AgcArg {
    Manual,
    Auto,
}

#[derive(Clone, Copy, ValueEnum)]
enum DscModeArg {
    Off,
    Unity,
    Auto,
}

#[derive(Subcommand)]
enum AgcOp {
    Get,
    Set {
        #[arg(value_enum)]
        value: AgcArg,
    },
}

#[derive(Subcommand)]
enum ModeOp {
    Get,
    Set {
        #[arg(value_enum)]
        value: DscModeArg,
    },
}

#[derive(Subcommand)]
enum DscCommand {
    /// Automatic gain control mode.
    Agc {
        #[command(subcommand)]
        op: AgcOp,
    },
    /// Conditioning mode.
    Mode {
        #[command(subcommand)]
        op: ModeOp,
    },
    /// Input power working point in dBm (manual AGC only).
    Gain {
        #[command(subcommand)]
        op: GainOp,
    },
    /// Switch selection: a fixed position or the rotating sequence.
    Switch {
        #[command(subcommand)]
        op: SwitchOp,
    },
    /// Persist the coefficient table to the last-good store.
    SaveLastgood,
}

#[derive(Subcommand)]
enum GainOp {
    Get,
    Set { dbm: i32 },
}

#[derive(Subcommand)]
enum SwitchOp {
    Get,
    Set {
        /// 0..15 for a fixed position, or "auto".
        position: String,
    },
}

#[derive(Subcommand)]
enum Command {
    /// Send a command to one clock servo.
    Clock {
        #[arg(value_enum)]
        target: ClockTarget,
        #[command(subcommand)]
        command: ClockCommand,
    },
    /// Set the intermediate-frequency NCO offset.
    Nco { offset: i64 },
    /// Talk to the signal-conditioning daemon.
    Dsc {
        #[command(subcommand)]
        command: DscCommand,
    },
    /// Arm a clock synchronisation in the event daemon.
    Sync {
        #[arg(value_enum)]
        target: ClockTarget,
    },
    /// Tail the clock daemon status stream.
    Status {
        /// Stop after this many parsed lines.
        #[arg(long, default_value = "20")]
        lines: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Clock { target, command } => {
            let body = match command {
                ClockCommand::Offset { value } => format!("o{}", value),
                ClockCommand::Phase { value } => format!("p{}", value),
                ClockCommand::Sync { value } => format!("s{}", value),
                ClockCommand::Verbose { value } => format!("v{}", value),
                ClockCommand::Interval { value } => format!("i{}", value),
                ClockCommand::OpenLoop { value } => format!("c{}", value),
                ClockCommand::Dac { value } => format!("d{}", value),
                ClockCommand::Raw { line } => line.clone(),
            };
            send_line(&cli.clock_fifo, &format!("{}{}", target.prefix(), body))
        }
        Command::Nco { offset } => send_line(&cli.clock_fifo, &format!("n{}", offset)),
        Command::Dsc { command } => dsc_request(&cli, command),
        Command::Sync { target } => {
            let keyword = match target {
                ClockTarget::Mc => "sync-mc",
                ClockTarget::Sc => "sync-sc",
            };
            send_line(&cli.event_fifo, keyword)
        }
        Command::Status { lines } => tail_status(&cli, *lines),
    }
}

fn send_line(path: &std::path::Path, line: &str) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} (is the daemon running?)", path.display()))?;
    fifo.write_all(format!("{}\n", line).as_bytes())
        .with_context(|| format!("writing to {}", path.display()))?;
    Ok(())
}

/// One request/reply exchange with the conditioning daemon.
fn exchange(cli: &Cli, kind: RequestKind, value: i32) -> Result<Request> {
    let request = Request::new(kind, value);
    let reply_path = request.reply_path();
    bpmd::runtime::create_fifo(&reply_path).context("creating reply fifo")?;
    // Open our read end first so the daemon's write cannot fail.
    let mut reply_fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&reply_path)?;

    let result = (|| {
        send_line_raw(&cli.dsc_fifo, &request.encode())?;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut record = [0u8; REQUEST_BYTES];
        let mut filled = 0;
        while filled < REQUEST_BYTES {
            if Instant::now() > deadline {
                bail!("timed out waiting for the conditioning daemon");
            }
            match reply_fifo.read(&mut record[filled..]) {
                Ok(0) => std::thread::sleep(Duration::from_millis(20)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e).context("reading reply fifo"),
            }
        }
        Ok(Request::decode(&record)?)
    })();
    let _ = std::fs::remove_file(&reply_path);
    result
}

fn send_line_raw(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening {} (is the daemon running?)", path.display()))?;
    fifo.write_all(bytes)
        .with_context(|| format!("writing to {}", path.display()))?;
    Ok(())
}

fn check(reply: &Request) -> Result<()> {
    match reply.status {
        0 => Ok(()),
        s if s == bpmd::dsc::engine::STATUS_TRY_AGAIN => {
            bail!("rate limited, try again in a minute")
        }
        s => bail!("daemon refused the request (status {})", s),
    }
}

fn dsc_request(cli: &Cli, command: &DscCommand) -> Result<()> {
    match command {
        DscCommand::Agc { op } => match op {
            AgcOp::Get => {
                let reply = exchange(cli, RequestKind::GetAgc, 0)?;
                check(&reply)?;
                println!(
                    "{}",
                    if reply.value == protocol::AGC_AUTO {
                        "auto"
                    } else {
                        "manual"
                    }
                );
            }
            AgcOp::Set { value } => {
                let encoded = match value {
                    AgcArg::Manual => protocol::AGC_MANUAL,
                    AgcArg::Auto => protocol::AGC_AUTO,
                };
                check(&exchange(cli, RequestKind::SetAgc, encoded)?)?;
            }
        },
        DscCommand::Mode { op } => match op {
            ModeOp::Get => {
                let reply = exchange(cli, RequestKind::GetDsc, 0)?;
                check(&reply)?;
                let name = match reply.value {
                    protocol::DSC_OFF => "off",
                    protocol::DSC_UNITY => "unity",
                    protocol::DSC_AUTO => "auto",
                    other => {
                        println!("unknown ({})", other);
                        return Ok(());
                    }
                };
                println!("{}", name);
            }
            ModeOp::Set { value } => {
                let encoded = match value {
                    DscModeArg::Off => protocol::DSC_OFF,
                    DscModeArg::Unity => protocol::DSC_UNITY,
                    DscModeArg::Auto => protocol::DSC_AUTO,
                };
                check(&exchange(cli, RequestKind::SetDsc, encoded)?)?;
            }
        },
        DscCommand::Gain { op } => match op {
            GainOp::Get => {
                let reply = exchange(cli, RequestKind::GetGain, 0)?;
                check(&reply)?;
                println!("{} dBm", reply.value);
            }
            GainOp::Set { dbm } => check(&exchange(cli, RequestKind::SetGain, *dbm)?)?,
        },
        DscCommand::Switch { op } => match op {
            SwitchOp::Get => {
                let reply = exchange(cli, RequestKind::GetSwitch, 0)?;
                check(&reply)?;
                if reply.value == protocol::SWITCH_AUTO {
                    println!("auto");
                } else {
                    println!("{}", reply.value);
                }
            }
            SwitchOp::Set { position } => {
                let encoded = if position == "auto" {
                    protocol::SWITCH_AUTO
                } else {
                    position
                        .parse::<i32>()
                        .context("switch position must be 0..15 or \"auto\"")?
                };
                check(&exchange(cli, RequestKind::SetSwitch, encoded)?)?;
            }
        },
        DscCommand::SaveLastgood => {
            check(&exchange(cli, RequestKind::SetDsc, protocol::DSC_SAVE_LASTGOOD)?)?
        }
    }
    Ok(())
}

/// Follow the status FIFO, pretty-printing parsed lines.
fn tail_status(cli: &Cli, limit: usize) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .read(true)
        .open(&cli.status_fifo)
        .with_context(|| {
            format!(
                "opening {} (is the clock daemon running?)",
                cli.status_fifo.display()
            )
        })?;

    let mut pending = String::new();
    let mut chunk = [0u8; 256];
    let mut printed = 0;
    while printed < limit {
        let n = fifo.read(&mut chunk).context("reading status fifo")?;
        if n == 0 {
            break;
        }
        pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
        while let Some(at) = pending.find('\n') {
            let line: String = pending.drain(..=at).collect();
            let line = line.trim_end_matches('\n');
            match parse_status_line(line) {
                Some(StatusLine::Stage {
                    prefix,
                    stage,
                    sync,
                }) => println!(
                    "{}: stage {} sync {}",
                    clock_name(prefix),
                    stage,
                    sync.as_int()
                ),
                Some(StatusLine::Verbose {
                    prefix,
                    frequency_error,
                    phase_error,
                    dac,
                }) => println!(
                    "{}: freq_err {} phase_err {} dac {}",
                    clock_name(prefix),
                    frequency_error,
                    phase_error,
                    dac
                ),
                Some(StatusLine::Resync) => println!("-- stream resync --"),
                None => println!("?? {}", line),
            }
            printed += 1;
            if printed >= limit {
                break;
            }
        }
    }
    Ok(())
}

fn clock_name(prefix: char) -> &'static str {
    match prefix {
        'm' => "MC",
        's' => "SC",
        _ => "??",
    }
}
