// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Out-of-band scheduling/mmap log
//!
//! The capture driver writes a second stream next to the per-CPU trace
//! files: fixed-size little-endian records describing process creation,
//! memory maps, thread switches and capture initialization. The core
//! consumes thread-switch, initialization and memory-map records; everything
//! else is skipped by record length.
//!
//! [`parse`] tokenizes the log; [`Model`] digests it into the queryable form
//! the rest of the pipeline needs: per-CPU switch events, a per-process
//! memory-map timeline for code-identity resolution, clock ratios, and the
//! scheduler branch-target address.

pub mod model;

#[cfg(test)]
pub(crate) mod testutil;
#[cfg(test)]
mod tests;

pub use model::{Mapping, Model, SwitchEvent, TidRegistry};

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::types::Rva;

/// Record length/type/counter header
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Length of the whole record, header included
    pub size: u32,
    /// Raw timestamp taken when the record was written
    pub tsc: u64,
    /// CPU the record was written from
    pub cpu: u32,
}

/// Header size on the wire: size, kind, tsc, cpu
const HEADER_LEN: usize = 20;

const KIND_INIT: u32 = 1;
const KIND_PROCESS: u32 = 2;
const KIND_MMAP: u32 = 3;
const KIND_MUNMAP: u32 = 4;
const KIND_SWITCH: u32 = 5;
const KIND_SCHEDADDR: u32 = 6;

/// One decoded sideband record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Capture initialization: clock ratios and the thread active on the
    /// record's CPU
    Init {
        pid: i32,
        tgid: i32,
        tsc_tick: u32,
        fsb_mhz: u32,
        tsc_ctc_ratio: u32,
        mtc_shift: u8,
    },
    Process {
        pid: i32,
        ppid: i32,
        tgid: i32,
        name: String,
    },
    Mmap {
        tgid: i32,
        start: Rva,
        len: u64,
        pgoff: u64,
        path: String,
    },
    Munmap {
        tgid: i32,
        start: Rva,
        len: u64,
    },
    /// Thread switch, carrying the trace byte offset recorded by the driver
    Switch {
        pid: i32,
        tgid: i32,
        prev_pid: i32,
        prev_tgid: i32,
        pkt_count: u32,
        trace_offset: u64,
    },
    /// Registration of the scheduler branch-target address
    SchedAddr { address: Rva },
}

/// Sideband parse errors
///
/// All of these are setup failures: a capture with an unreadable sideband
/// log cannot be processed at all.
#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated sideband record at byte {0}")]
    Truncated(usize),
    #[error("sideband record at byte {0} has impossible size {1}")]
    BadSize(usize, u32),
    #[error("reading sideband log")]
    Io(#[from] std::io::Error),
}

/// Parse a complete sideband log
///
/// Unknown record kinds are skipped using the header length; a record
/// running past the end of the input is an error.
pub fn parse(data: &[u8]) -> Result<Vec<(RecordHeader, Record)>, Error> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        if data.len() - pos < HEADER_LEN {
            return Err(Error::Truncated(pos));
        }
        let mut cursor = Cursor::new(&data[pos..]);
        let size = cursor.read_u32::<LittleEndian>()?;
        let kind = cursor.read_u32::<LittleEndian>()?;
        let tsc = cursor.read_u64::<LittleEndian>()?;
        let cpu = cursor.read_u32::<LittleEndian>()?;

        if (size as usize) < HEADER_LEN {
            return Err(Error::BadSize(pos, size));
        }
        if pos + size as usize > data.len() {
            return Err(Error::Truncated(pos));
        }
        let header = RecordHeader { size, tsc, cpu };
        let payload = &data[pos + HEADER_LEN..pos + size as usize];

        if let Some(record) = decode_payload(kind, payload).map_err(|_| Error::Truncated(pos))? {
            records.push((header, record));
        }

        pos += size as usize;
    }

    Ok(records)
}

fn decode_payload(kind: u32, payload: &[u8]) -> Result<Option<Record>, std::io::Error> {
    let mut r = Cursor::new(payload);
    let record = match kind {
        KIND_INIT => Record::Init {
            pid: r.read_i32::<LittleEndian>()?,
            tgid: r.read_i32::<LittleEndian>()?,
            tsc_tick: r.read_u32::<LittleEndian>()?,
            fsb_mhz: r.read_u32::<LittleEndian>()?,
            tsc_ctc_ratio: r.read_u32::<LittleEndian>()?,
            mtc_shift: r.read_u8()?,
        },
        KIND_PROCESS => Record::Process {
            pid: r.read_i32::<LittleEndian>()?,
            ppid: r.read_i32::<LittleEndian>()?,
            tgid: r.read_i32::<LittleEndian>()?,
            name: read_name(&mut r)?,
        },
        KIND_MMAP => Record::Mmap {
            tgid: r.read_i32::<LittleEndian>()?,
            start: r.read_u64::<LittleEndian>()?,
            len: r.read_u64::<LittleEndian>()?,
            pgoff: r.read_u64::<LittleEndian>()?,
            path: read_name(&mut r)?,
        },
        KIND_MUNMAP => Record::Munmap {
            tgid: r.read_i32::<LittleEndian>()?,
            start: r.read_u64::<LittleEndian>()?,
            len: r.read_u64::<LittleEndian>()?,
        },
        KIND_SWITCH => Record::Switch {
            pid: r.read_i32::<LittleEndian>()?,
            tgid: r.read_i32::<LittleEndian>()?,
            prev_pid: r.read_i32::<LittleEndian>()?,
            prev_tgid: r.read_i32::<LittleEndian>()?,
            pkt_count: r.read_u32::<LittleEndian>()?,
            trace_offset: r.read_u64::<LittleEndian>()?,
        },
        KIND_SCHEDADDR => Record::SchedAddr {
            address: r.read_u64::<LittleEndian>()?,
        },
        _ => return Ok(None),
    };
    Ok(Some(record))
}

/// Read a NUL-padded string field filling the rest of the payload
fn read_name(r: &mut Cursor<&[u8]>) -> Result<String, std::io::Error> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}
