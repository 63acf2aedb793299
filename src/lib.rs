// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! # Decoder and execution-model replay for Intel Processor Trace captures
//!
//! This crate turns a completed hardware trace capture (one dense packet
//! file per CPU plus an out-of-band log of OS scheduling and mmap events)
//! into per-thread symbolic instruction traces. It correlates three
//! independently-clocked sources into one timeline and replays the
//! reconstructed control flow against disassembled binaries.
//!
//! The pipeline, bottom up:
//!
//! * [`packet`] tokenizes raw bytes into typed packets,
//! * [`timing`] assigns wall-clock-comparable timestamps to the trace's
//!   wrapping hardware counters,
//! * [`sched`] maps the OS scheduling log onto trace byte offsets and
//!   derives per-thread ownership quanta,
//! * [`collection`] partitions a capture into per-thread tasks behind a
//!   round-trippable manifest, and
//! * [`tracer`] replays a task instruction by instruction through the
//!   [`binary`] disassembler seam, emitting the output record stream.
//!
//! [`sideband`] parses the out-of-band log, [`symbols`] interns names into
//! the dense ids the output format uses, and [`pool`] bounds replay
//! parallelism.
//!
//! # Example
//!
//! Decoding a single packet stream:
//!
//! ```
//! use ipt_replay::packet::{Decoder, Packet};
//!
//! let data = b"\x19\x40\x02\x00\x00\x00\x00\x00\x59\x07";
//! let mut decoder = Decoder::new(data);
//! assert_eq!(decoder.next_packet().unwrap().kind, Packet::Tsc(0x240));
//! assert_eq!(decoder.next_packet().unwrap().kind, Packet::Mtc(7));
//! ```

pub mod binary;
pub mod collection;
pub mod packet;
pub mod pool;
pub mod sched;
pub mod sideband;
pub mod stats;
pub mod symbols;
pub mod timing;
pub mod tracer;
pub mod types;

pub use collection::Collection;
pub use stats::RunStatistics;
pub use types::{Rva, TracePos, TscInterval, Tid};
