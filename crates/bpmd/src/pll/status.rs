// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared status pipe.
//!
//! Both servo threads report through one pipe, serialised by a single
//! lock. A short or failed write raises the overflow flag; the next line
//! is then preceded by a literal `x\n` marker so the reader can resync.
//! The flag starts raised, so the very first line on startup is always
//! the reset marker.

use super::SyncState;
use parking_lot::Mutex;
use std::io::Write;

struct StatusSink {
    out: Box<dyn Write + Send>,
    overflow: bool,
}

/// Serialised, overflow-aware writer for controller status lines.
pub struct StatusWriter {
    sink: Mutex<StatusSink>,
}

impl StatusWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(StatusSink {
                out,
                overflow: true,
            }),
        }
    }

    /// Write one status line (terminated by the caller). Short writes are
    /// not retried; they raise the overflow flag instead.
    pub fn write_line(&self, line: &str) {
        let mut sink = self.sink.lock();
        if sink.overflow {
            // Interpreted as loss of connection by the reader.
            let _ = sink.out.write(b"x\n");
        }
        let complete = match sink.out.write(line.as_bytes()) {
            Ok(n) => n == line.len(),
            Err(_) => false,
        };
        let _ = sink.out.flush();
        sink.overflow = !complete;
    }
}

/// Parsed form of one status-pipe line, as consumed by the status monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine {
    /// `<prefix>s<stage> <sync>`
    Stage {
        prefix: char,
        stage: u32,
        sync: SyncState,
    },
    /// `<prefix>v<freq_err> <phase_err> <dac>`
    Verbose {
        prefix: char,
        frequency_error: i32,
        phase_error: i32,
        dac: u32,
    },
    /// `x` -- pipe overflow resync marker.
    Resync,
}

/// Parse one line from the status pipe (without its trailing newline).
pub fn parse_status_line(line: &str) -> Option<StatusLine> {
    if line == "x" {
        return Some(StatusLine::Resync);
    }
    let mut chars = line.chars();
    let prefix = chars.next()?;
    let kind = chars.next()?;
    let rest = chars.as_str();
    match kind {
        's' => {
            let mut fields = rest.split(' ');
            let stage = fields.next()?.parse().ok()?;
            let sync = SyncState::from_int(fields.next()?.parse().ok()?)?;
            Some(StatusLine::Stage {
                prefix,
                stage,
                sync,
            })
        }
        'v' => {
            let mut fields = rest.split(' ');
            let frequency_error = fields.next()?.parse().ok()?;
            let phase_error = fields.next()?.parse().ok()?;
            let dac = fields.next()?.parse().ok()?;
            Some(StatusLine::Verbose {
                prefix,
                frequency_error,
                phase_error,
                dac,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    /// Sink that completes only the first `accept` bytes of each write.
    struct ChokedSink {
        accept: Option<usize>,
        captured: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for ChokedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.accept.unwrap_or(buf.len()).min(buf.len());
            self.captured.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Arc<Mutex<Vec<u8>>>, StatusWriter) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let writer = StatusWriter::new(Box::new(ChokedSink {
            accept: None,
            captured: Arc::clone(&captured),
        }));
        (captured, writer)
    }

    #[test]
    fn first_line_carries_reset_marker() {
        let (captured, writer) = capture();
        writer.write_line("ms1 0\n");
        writer.write_line("ms2 0\n");
        assert_eq!(&*captured.lock(), b"x\nms1 0\nms2 0\n");
    }

    #[test]
    fn short_write_raises_marker_on_next_line() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let writer = StatusWriter::new(Box::new(ChokedSink {
            accept: Some(3),
            captured: Arc::clone(&captured),
        }));
        writer.write_line("ms1 0\n");
        writer.write_line("ms2 0\n");
        // Both lines truncated to 3 bytes; each preceded by a marker.
        assert_eq!(&*captured.lock(), b"x\nms1x\nms2");
    }

    #[test]
    fn parse_round_trip() {
        assert_eq!(
            parse_status_line("ms2 1"),
            Some(StatusLine::Stage {
                prefix: 'm',
                stage: 2,
                sync: SyncState::Tracking
            })
        );
        assert_eq!(
            parse_status_line("sv-3 5 32768"),
            Some(StatusLine::Verbose {
                prefix: 's',
                frequency_error: -3,
                phase_error: 5,
                dac: 32768
            })
        );
        assert_eq!(parse_status_line("x"), Some(StatusLine::Resync));
        assert_eq!(parse_status_line("zz"), None);
    }
}
