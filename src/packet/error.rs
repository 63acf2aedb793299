// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Packet-specific error type

use thiserror::Error;

use crate::types::TracePos;

/// Unrecoverable decode errors
///
/// Each of these aborts the current decode unit; the caller decides whether
/// to resynchronize at the next sync marker. Recoverable conditions
/// (premature end-of-stream inside a packet) are not errors: the decoder
/// logs them and yields [`Packet::Eof`][super::Packet::Eof].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown opcode {opcode:#04x} at {pos:#x}")]
    UnknownOpcode { opcode: u8, pos: TracePos },
    #[error("unknown extended opcode {opcode:#04x} at {pos:#x}")]
    UnknownExtended { opcode: u8, pos: TracePos },
    #[error("corrupt sync marker template at {pos:#x}")]
    BrokenSync { pos: TracePos },
    #[error("reserved address-byte count {count} at {pos:#x}")]
    ReservedAddressBytes { count: u8, pos: TracePos },
    #[error("cycle-count packet exceeds maximum length at {pos:#x}")]
    OversizedCyc { pos: TracePos },
    #[error("illegal mode payload {payload:#04x} at {pos:#x}")]
    BadMode { payload: u8, pos: TracePos },
}

impl Error {
    /// Position of the offending packet
    pub fn pos(&self) -> TracePos {
        match *self {
            Self::UnknownOpcode { pos, .. }
            | Self::UnknownExtended { pos, .. }
            | Self::BrokenSync { pos }
            | Self::ReservedAddressBytes { pos, .. }
            | Self::OversizedCyc { pos }
            | Self::BadMode { pos, .. } => pos,
        }
    }
}
