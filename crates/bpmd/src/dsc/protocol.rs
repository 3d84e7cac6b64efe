// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client request protocol of the conditioning daemon.
//!
//! Requests are fixed-layout 20-byte records written to the daemon's
//! request FIFO; the reply (the same record with `status` filled in) is
//! written back to the per-client FIFO `/tmp/<pid>.fifo`. Validation
//! checks the magic, the type range and that the claimed sender PID still
//! names a live process.

use crate::runtime::process_alive;
use thiserror::Error;

/// Server magic number.
pub const REQUEST_MAGIC: u32 = 90205;

/// Encoded size of one request record.
pub const REQUEST_BYTES: usize = 20;

/// Mode values of `SET_DSC`.
pub const DSC_OFF: i32 = 0;
pub const DSC_UNITY: i32 = 1;
pub const DSC_AUTO: i32 = 2;
/// `SET_DSC` pseudo-mode: persist the current table to the last-good
/// store.
pub const DSC_SAVE_LASTGOOD: i32 = 3;

/// Mode values of `SET_AGC`.
pub const AGC_MANUAL: i32 = 0;
pub const AGC_AUTO: i32 = 1;

/// `SET_SWITCH` value selecting the rotating sequence.
pub const SWITCH_AUTO: i32 = 0xFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic {0}")]
    BadMagic(u32),
    #[error("unknown request type {0}")]
    BadType(u32),
    #[error("sender pid {0} is not alive")]
    DeadSender(i32),
    #[error("short request: {0} bytes")]
    Short(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    SetAgc = 1,
    GetAgc = 2,
    SetDsc = 3,
    GetDsc = 4,
    SetGain = 5,
    GetGain = 6,
    SetSwitch = 7,
    GetSwitch = 8,
}

impl TryFrom<u32> for RequestKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => RequestKind::SetAgc,
            2 => RequestKind::GetAgc,
            3 => RequestKind::SetDsc,
            4 => RequestKind::GetDsc,
            5 => RequestKind::SetGain,
            6 => RequestKind::GetGain,
            7 => RequestKind::SetSwitch,
            8 => RequestKind::GetSwitch,
            other => return Err(ProtocolError::BadType(other)),
        })
    }
}

/// One client request (and, with `status` filled in, its reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub magic: u32,
    pub kind: u32,
    pub value: i32,
    pub pid: i32,
    pub status: i32,
}

impl Request {
    pub fn new(kind: RequestKind, value: i32) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            kind: kind as u32,
            value,
            pid: std::process::id() as i32,
            status: 0,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_BYTES] {
        let mut out = [0u8; REQUEST_BYTES];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.kind.to_le_bytes());
        out[8..12].copy_from_slice(&self.value.to_le_bytes());
        out[12..16].copy_from_slice(&self.pid.to_le_bytes());
        out[16..20].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < REQUEST_BYTES {
            return Err(ProtocolError::Short(bytes.len()));
        }
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        Ok(Self {
            magic: word(0),
            kind: word(4),
            value: word(8) as i32,
            pid: word(12) as i32,
            status: word(16) as i32,
        })
    }

    /// Validate a decoded request before acting on it.
    pub fn validate(&self) -> Result<RequestKind, ProtocolError> {
        if self.magic != REQUEST_MAGIC {
            return Err(ProtocolError::BadMagic(self.magic));
        }
        let kind = RequestKind::try_from(self.kind)?;
        if !process_alive(self.pid) {
            return Err(ProtocolError::DeadSender(self.pid));
        }
        Ok(kind)
    }

    /// Path of the per-client reply FIFO.
    pub fn reply_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/tmp/{}.fifo", self.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let request = Request::new(RequestKind::SetGain, -42);
        let decoded = Request::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.validate().unwrap(), RequestKind::SetGain);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let mut request = Request::new(RequestKind::GetDsc, 0);
        request.magic = 1;
        assert_eq!(
            request.validate(),
            Err(ProtocolError::BadMagic(1))
        );

        let mut request = Request::new(RequestKind::GetDsc, 0);
        request.kind = 99;
        assert_eq!(request.validate(), Err(ProtocolError::BadType(99)));

        let mut request = Request::new(RequestKind::GetDsc, 0);
        request.pid = 999_999_999;
        assert!(matches!(
            request.validate(),
            Err(ProtocolError::DeadSender(_))
        ));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(
            Request::decode(&[0u8; 10]),
            Err(ProtocolError::Short(10))
        );
    }
}
