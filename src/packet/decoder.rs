// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Packet decoder

use log::warn;

use crate::types::{Rva, TracePos};

use super::error::Error;
use super::{ExecMode, Packet, Tnt, TracePacket, TsxMode};

/// The sync marker's fixed on-wire form
pub const SYNC_TEMPLATE: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// A decoder for trace packets
///
/// The decoder walks a byte slice and produces one [`TracePacket`] per call
/// to [`next_packet`][Self::next_packet]. It is stateless between packets
/// apart from the last-address cache needed to reconstruct compressed
/// target addresses and the in-sync-region flag.
///
/// Reaching the end of the input yields [`Packet::Eof`]; so does running out
/// of bytes in the middle of a multi-byte packet, which is additionally
/// logged as a decode warning. Malformed packets yield an [`Error`] and the
/// decoder should not be advanced further without
/// [`skip_to_sync`][Self::skip_to_sync].
#[derive(Clone)]
pub struct Decoder<'d> {
    data: &'d [u8],
    pos: usize,
    packet_start: usize,
    base: TracePos,
    last_ip: Rva,
    in_psb: bool,
}

impl<'d> Decoder<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        Self {
            data,
            pos: 0,
            packet_start: 0,
            base: 0,
            last_ip: 0,
            in_psb: false,
        }
    }

    /// Set the absolute trace position of the slice's first byte
    ///
    /// Positions reported in packets and errors are offset by this value,
    /// allowing a decoder over a sub-slice of a trace file to report
    /// file-absolute positions.
    pub fn at_offset(self, base: TracePos) -> Self {
        Self { base, ..self }
    }

    /// Absolute position of the next byte to be decoded
    pub fn pos(&self) -> TracePos {
        self.base + self.pos as TracePos
    }

    /// Absolute position of the most recently started packet
    pub fn packet_pos(&self) -> TracePos {
        self.base + self.packet_start as TracePos
    }

    /// Number of bytes left in the input
    pub fn bytes_left(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check whether the decoder is inside a sync bracket
    pub fn in_sync_region(&self) -> bool {
        self.in_psb
    }

    /// Decode the next packet
    pub fn next_packet(&mut self) -> Result<TracePacket, Error> {
        self.packet_start = self.pos;

        let Some(&opcode) = self.data.get(self.pos) else {
            return Ok(self.packet(Packet::Eof));
        };
        self.pos += 1;

        let kind = match opcode {
            0x00 => Packet::Pad,
            0x02 => return self.extended(),
            0x19 => match self.take(7) {
                Some(p) => {
                    let mut tsc = 0u64;
                    for (i, b) in p.iter().enumerate() {
                        tsc |= u64::from(*b) << (i * 8);
                    }
                    Packet::Tsc(tsc)
                }
                None => return Ok(self.truncated()),
            },
            0x59 => match self.take(1) {
                Some(p) => Packet::Mtc(p[0]),
                None => return Ok(self.truncated()),
            },
            0x99 => return self.mode(),
            c if c & 0x01 == 0x00 => {
                Packet::ShortTnt(Tnt::from_stop_delimited(u64::from(c >> 1), 6))
            }
            c if c & 0x03 == 0x03 => return self.cyc(c),
            c if c & 0x1f == 0x01 => return self.target(c, Packet::TipPgd),
            c if c & 0x1f == 0x0d => return self.target(c, Packet::Tip),
            c if c & 0x1f == 0x11 => return self.target(c, Packet::TipPge),
            c if c & 0x1f == 0x1d => return self.target(c, Packet::Fup),
            c => {
                return Err(Error::UnknownOpcode {
                    opcode: c,
                    pos: self.packet_pos(),
                })
            }
        };

        Ok(self.packet(kind))
    }

    /// Skip forward to the next sync marker
    ///
    /// Scans for the fixed sync template, leaving the decoder positioned at
    /// its first byte. Returns the number of bytes skipped, or `None` if no
    /// further sync marker exists (the decoder is left at end of input).
    pub fn skip_to_sync(&mut self) -> Option<usize> {
        let from = self.pos;
        let found = self.data[from..]
            .windows(SYNC_TEMPLATE.len())
            .position(|w| w == SYNC_TEMPLATE);
        match found {
            Some(delta) => {
                self.pos = from + delta;
                self.in_psb = false;
                Some(delta)
            }
            None => {
                self.pos = self.data.len();
                None
            }
        }
    }

    /// Dispatch on the second byte of an extended packet
    fn extended(&mut self) -> Result<TracePacket, Error> {
        let Some(ext) = self.take(1).map(|p| p[0]) else {
            return Ok(self.truncated());
        };

        let kind = match ext {
            0x03 => match self.take(2) {
                Some(p) => Packet::Cbr(p[0]),
                None => return Ok(self.truncated()),
            },
            0x23 => {
                self.in_psb = false;
                Packet::Psbend
            }
            0x43 => match self.take(6) {
                Some(p) => {
                    let mut raw = [0u8; 8];
                    raw[2..8].copy_from_slice(p);
                    raw[0] = 0x02;
                    raw[1] = 0x43;
                    let raw = u64::from_le_bytes(raw);
                    Packet::Pip {
                        nr: raw & 0x10000 != 0,
                        cr3: (raw >> 17) << 5,
                    }
                }
                None => return Ok(self.truncated()),
            },
            0x73 => match self.take(5) {
                Some(p) => Packet::Tma {
                    ctc: u16::from_le_bytes([p[0], p[1]]),
                    fast: u16::from_le_bytes([p[3], p[4]]) & 0x01ff,
                },
                None => return Ok(self.truncated()),
            },
            0x82 => return self.sync_marker(),
            0x83 => Packet::TraceStop,
            0xa3 => match self.take(6) {
                Some(p) => {
                    let mut bits = 0u64;
                    for (i, b) in p.iter().enumerate() {
                        bits |= u64::from(*b) << (i * 8);
                    }
                    Packet::LongTnt(Tnt::from_stop_delimited(bits, 47))
                }
                None => return Ok(self.truncated()),
            },
            0xc3 => match self.take(8) {
                Some(_) => Packet::Mnt,
                None => return Ok(self.truncated()),
            },
            0xc8 => match self.take(5) {
                Some(p) => {
                    let mut base = 0u64;
                    for (i, b) in p.iter().enumerate() {
                        base |= u64::from(*b) << (12 + i * 8);
                    }
                    Packet::Vmcs(base)
                }
                None => return Ok(self.truncated()),
            },
            0xf3 => Packet::Ovf,
            c => {
                return Err(Error::UnknownExtended {
                    opcode: c,
                    pos: self.packet_pos(),
                })
            }
        };

        Ok(self.packet(kind))
    }

    /// Validate the remainder of the 16-byte sync template
    fn sync_marker(&mut self) -> Result<TracePacket, Error> {
        let Some(rest) = self.take(14) else {
            return Ok(self.truncated());
        };
        if rest != &SYNC_TEMPLATE[2..] {
            return Err(Error::BrokenSync {
                pos: self.packet_pos(),
            });
        }
        self.in_psb = true;
        Ok(self.packet(Packet::Psb))
    }

    /// Decode a MODE packet
    fn mode(&mut self) -> Result<TracePacket, Error> {
        let Some(payload) = self.take(1).map(|p| p[0]) else {
            return Ok(self.truncated());
        };

        let kind = match payload >> 5 {
            0x00 => match payload & 0x03 {
                0x00 => Packet::ModeExec(ExecMode::Bits16),
                0x01 => Packet::ModeExec(ExecMode::Bits64),
                0x02 => Packet::ModeExec(ExecMode::Bits32),
                _ => {
                    return Err(Error::BadMode {
                        payload,
                        pos: self.packet_pos(),
                    })
                }
            },
            0x01 => match payload & 0x03 {
                0x00 => Packet::ModeTsx(TsxMode::Out),
                0x01 => Packet::ModeTsx(TsxMode::In),
                0x02 => Packet::ModeTsx(TsxMode::Abort),
                _ => {
                    return Err(Error::BadMode {
                        payload,
                        pos: self.packet_pos(),
                    })
                }
            },
            _ => {
                return Err(Error::BadMode {
                    payload,
                    pos: self.packet_pos(),
                })
            }
        };

        Ok(self.packet(kind))
    }

    /// Decode a cycle-count packet, discarding its payload
    fn cyc(&mut self, first: u8) -> Result<TracePacket, Error> {
        let mut exp = first & 0x04 != 0;
        let mut len = 0;
        while exp {
            len += 1;
            if len > 14 {
                return Err(Error::OversizedCyc {
                    pos: self.packet_pos(),
                });
            }
            let Some(b) = self.take(1).map(|p| p[0]) else {
                return Ok(self.truncated());
            };
            exp = b & 0x01 != 0;
        }
        Ok(self.packet(Packet::Cyc))
    }

    /// Decode a target-address packet, merging onto the last-address cache
    fn target(
        &mut self,
        opcode: u8,
        kind: fn(Option<Rva>) -> Packet,
    ) -> Result<TracePacket, Error> {
        let ip_bytes = opcode >> 5;
        if ip_bytes > 3 {
            return Err(Error::ReservedAddressBytes {
                count: ip_bytes,
                pos: self.packet_pos(),
            });
        }

        let Some(payload) = self.take(2 * usize::from(ip_bytes)) else {
            return Ok(self.truncated());
        };
        let mut raw = 0u64;
        for (i, b) in payload.iter().enumerate() {
            raw |= u64::from(*b) << (i * 8);
        }

        let address = match ip_bytes {
            0 => None,
            1 => Some((self.last_ip & 0xffff_ffff_ffff_0000) | raw),
            2 => Some((self.last_ip & 0xffff_ffff_0000_0000) | raw),
            _ => Some(((raw << 16) as i64 >> 16) as u64),
        };
        if let Some(address) = address {
            self.last_ip = address;
        }

        Ok(self.packet(kind(address)))
    }

    /// Take `n` payload bytes if that many are left
    fn take(&mut self, n: usize) -> Option<&'d [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let payload = &self.data[self.pos..end];
        self.pos = end;
        Some(payload)
    }

    /// Assemble the packet spanning from the packet start to the current position
    fn packet(&self, kind: Packet) -> TracePacket {
        TracePacket {
            pos: self.base + self.packet_start as TracePos,
            len: self.pos - self.packet_start,
            kind,
        }
    }

    /// Report a packet cut short by the end of the input
    ///
    /// Recoverable per the error taxonomy: the stream is treated as ended.
    fn truncated(&mut self) -> TracePacket {
        warn!(
            "packet at {:#x} truncated by end of stream",
            self.packet_pos()
        );
        self.pos = self.data.len();
        self.packet(Packet::Eof)
    }
}
