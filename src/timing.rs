// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Timestamp reconciliation
//!
//! The trace interleaves three timing packet kinds: a rare but precise
//! coarse counter, a frequent 8-bit compressed counter that wraps, and a
//! counter-ratio pair relating the two. This module collects those packets
//! into a per-CPU [`Timeline`] and assigns a best-effort resolved timestamp
//! to as many items as possible in four annotation passes, preserving
//! global monotonicity on a best-effort basis.
//!
//! Items are annotated in place and never reordered; the only mutation
//! besides annotation is the removal of compressed-counter items whose
//! extrapolated timestamp would overtake the next ratio item (decode noise
//! that arrived impossibly early).

mod passes;

#[cfg(test)]
mod tests;

use log::{error, info};

use crate::packet::{self, Decoder, Packet};
use crate::types::{TracePos, TscInterval};

/// Clock ratios from the sideband initialization record
#[derive(Copy, Clone, Debug)]
pub struct ClockRatios {
    /// Coarse-counter ticks per compressed-counter tick
    pub tsc_ctc_ratio: u32,
    /// Exponent relating the compressed counter to its 8-bit wire form
    pub mtc_shift: u8,
}

impl ClockRatios {
    /// Coarse ticks covered by one compressed-counter packet increment
    pub fn ticks_per_mtc(&self) -> u64 {
        (1u64 << self.mtc_shift) * u64::from(self.tsc_ctc_ratio)
    }

    /// Coarse ticks covered by a full wrap of the 8-bit compressed counter
    pub fn ticks_per_rollover(&self) -> u64 {
        255 * self.ticks_per_mtc()
    }

    /// Compressed-counter value implied by a ratio packet's ctc payload
    pub fn mtc_of_ctc(&self, ctc: u16) -> u8 {
        ((ctc >> self.mtc_shift) & 0xff) as u8
    }
}

/// Kind of a timing item
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimingKind {
    /// Coarse counter packet
    Tsc,
    /// Compressed counter packet
    Mtc,
    /// Counter-ratio pair
    Tma,
    /// Hardware overflow marker
    Ovf,
}

/// How an item's resolved timestamp was derived
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Pass {
    /// No timestamp assigned yet (the resolved value is 0)
    #[default]
    Unresolved,
    /// Ratio item confirmed directly against its neighbors (pass 1)
    Complete,
    /// Ratio item whose rollover bit was corrected from a neighbor (pass 2)
    Corrected,
    /// Compressed-counter item interpolated within a ratio interval (pass 3)
    Extrapolated,
    /// Compressed-counter item in a block with exactly counted rollovers
    /// (pass 4)
    Rollover,
    /// Compressed-counter item in the open-ended tail (pass 4)
    Tail,
}

/// One timing packet, annotated across the reconciliation passes
#[derive(Clone, Debug)]
pub struct TimingItem {
    pub pos: TracePos,
    pub kind: TimingKind,
    /// Compressed-counter value: the wire payload for [`TimingKind::Mtc`],
    /// derived from ctc for [`TimingKind::Tma`]
    pub mtc: u8,
    /// Resolved timestamp; 0 means unresolved
    pub tsc: u64,
    /// Ratio payload (ratio items only)
    pub ctc: u16,
    pub fast: u16,
    pub pass: Pass,
    /// Predicted timestamp of the next compressed-counter packet
    pub tsc_in_next_mtc: u64,
    /// Predicted number of compressed-counter packets until the next ratio
    /// item
    pub mtc_count: u64,
    /// Pass 3 counted exactly the predicted number of counter rollovers
    pub known_rollovers: bool,
}

impl TimingItem {
    fn new(pos: TracePos, kind: TimingKind) -> Self {
        Self {
            pos,
            kind,
            mtc: 0,
            tsc: 0,
            ctc: 0,
            fast: 0,
            pass: Pass::Unresolved,
            tsc_in_next_mtc: 0,
            mtc_count: 0,
            known_rollovers: false,
        }
    }
}

/// Kind of a decoder start point
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartKind {
    /// Sync marker
    Sync,
    /// Trace resumes with a known program counter
    Resume,
    /// Overflow marker
    Overflow,
}

/// A maximal run of trace positions with uniform timestamp knowledge
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimedBlock {
    pub pos: (TracePos, TracePos),
    pub has_tsc: bool,
    pub tsc: (u64, u64),
}

/// Reconciled timing information for one CPU's trace
pub struct Timeline {
    items: Vec<TimingItem>,
    starts: Vec<(TracePos, StartKind)>,
}

impl Timeline {
    /// Collect timing packets from a raw trace
    ///
    /// Compressed-counter packets between a coarse-counter packet and its
    /// ratio pair, or inside a sync bracket, are suppressed: their phase is
    /// already accounted for by the ratio item.
    pub fn scan(data: &[u8]) -> Result<Self, packet::Error> {
        let mut items = Vec::new();
        let mut starts = Vec::new();
        let mut decoder = Decoder::new(data);
        let mut wait_for_tma = false;

        loop {
            let in_sync = decoder.in_sync_region();
            let packet = decoder.next_packet()?;
            match packet.kind {
                Packet::Tsc(value) => {
                    let mut item = TimingItem::new(packet.pos, TimingKind::Tsc);
                    item.tsc = value;
                    items.push(item);
                    wait_for_tma = true;
                }
                Packet::Mtc(mtc) => {
                    if !wait_for_tma && !in_sync {
                        let mut item = TimingItem::new(packet.pos, TimingKind::Mtc);
                        item.mtc = mtc;
                        items.push(item);
                    }
                }
                Packet::Tma { ctc, fast } => {
                    let mut item = TimingItem::new(packet.pos, TimingKind::Tma);
                    item.ctc = ctc;
                    item.fast = fast;
                    items.push(item);
                    wait_for_tma = false;
                }
                Packet::Ovf => {
                    items.push(TimingItem::new(packet.pos, TimingKind::Ovf));
                    starts.push((packet.pos, StartKind::Overflow));
                }
                Packet::Psb => starts.push((packet.pos, StartKind::Sync)),
                Packet::TipPge(_) => starts.push((packet.pos, StartKind::Resume)),
                Packet::Eof => break,
                _ => (),
            }
        }

        Ok(Self { items, starts })
    }

    /// Run the reconciliation passes
    pub fn apply(&mut self, ratios: &ClockRatios) {
        passes::first(&mut self.items, ratios);
        passes::second(&mut self.items);
        passes::third(&mut self.items, ratios);
        passes::fourth(&mut self.items, ratios);

        match self.check_monotonic() {
            Ok(()) => info!("timestamp reconciliation sane"),
            Err(pos) => error!("timestamp monotonicity violated at {pos:#x}"),
        }
    }

    /// Bracketing interval for a position
    ///
    /// Returns the most recent resolved timestamp at or before `pos` and the
    /// next resolved timestamp after it, or `None` if either side is
    /// missing.
    pub fn bracket(&self, pos: TracePos) -> Option<TscInterval> {
        let mut i = self.items.partition_point(|t| t.pos <= pos);
        while i > 0 {
            i -= 1;
            let tsc = self.items[i].tsc;
            if tsc != 0 {
                let next = self.next_greater(i, tsc)?;
                return Some(TscInterval::new(tsc, next));
            }
        }
        None
    }

    /// Widened bracketing interval: one resolved value further in each
    /// direction where available
    pub fn wide_bracket(&self, pos: TracePos) -> Option<TscInterval> {
        let mut i = self.items.partition_point(|t| t.pos <= pos);
        while i > 0 {
            i -= 1;
            let tsc = self.items[i].tsc;
            if tsc != 0 {
                let begin = self.prev_smaller(i, tsc).unwrap_or(tsc);
                let next = self.next_greater(i, tsc)?;
                let end = self.next_greater_value(next).unwrap_or(next);
                return Some(TscInterval::new(begin, end));
            }
        }
        None
    }

    /// Coalesce timing items into blocks of uniform timestamp knowledge
    pub fn timed_blocks(&self) -> Vec<TimedBlock> {
        let mut blocks = Vec::new();

        let mut have_block = false;
        let mut start_pos = 0;
        let mut end_pos = 0;
        let mut block_size = 0;
        let mut have_tsc = false;
        let mut start_tsc = 0;
        let mut end_tsc = 0;

        for (i, item) in self.items.iter().enumerate() {
            let tsc = item.tsc;
            let mut next_tsc = 0;
            let mut got_tsc = tsc != 0;
            if tsc != 0 {
                match self.next_greater(i, tsc) {
                    Some(n) => next_tsc = n,
                    None => got_tsc = false,
                }
            }

            if !have_block {
                start_pos = item.pos;
                block_size = 0;
                start_tsc = tsc;
                end_tsc = next_tsc;
                have_tsc = got_tsc;
                have_block = true;
            } else {
                end_pos = item.pos;
                block_size = item.pos - start_pos;
                if have_tsc == got_tsc && start_tsc <= tsc && end_tsc <= next_tsc {
                    end_tsc = next_tsc;
                } else {
                    blocks.push(TimedBlock {
                        pos: (start_pos, end_pos),
                        has_tsc: have_tsc,
                        tsc: (start_tsc, end_tsc),
                    });
                    start_pos = item.pos;
                    block_size = 0;
                    start_tsc = tsc;
                    end_tsc = next_tsc;
                    have_tsc = got_tsc;
                }
            }
        }
        if have_block && block_size != 0 {
            blocks.push(TimedBlock {
                pos: (start_pos, end_pos),
                has_tsc: have_tsc,
                tsc: (start_tsc, end_tsc),
            });
        }

        blocks
    }

    /// Latest decoder start point at or before the given position
    pub fn last_sync(&self, pos: TracePos) -> TracePos {
        if self.starts.is_empty() {
            return 0;
        }
        let mut i = self.starts.partition_point(|(p, _)| *p <= pos);
        if i > 0 {
            i -= 1;
        }
        self.starts[i].0
    }

    /// First resolved timestamp strictly after the given position
    pub fn next_resolved(&self, pos: TracePos) -> Option<(TracePos, u64)> {
        let from = self.items.partition_point(|t| t.pos <= pos);
        self.items[from..]
            .iter()
            .find(|t| t.tsc != 0)
            .map(|t| (t.pos, t.tsc))
    }

    /// The reconciled items in position order
    pub fn items(&self) -> &[TimingItem] {
        &self.items
    }

    /// Verify that resolved compressed-counter timestamps never decrease
    fn check_monotonic(&self) -> Result<(), TracePos> {
        let mut last = 0u64;
        for item in &self.items {
            if item.kind == TimingKind::Mtc && item.pass != Pass::Unresolved {
                if item.tsc != 0 && item.tsc <= last {
                    return Err(item.pos);
                }
                last = item.tsc;
            }
        }
        Ok(())
    }

    /// First resolved timestamp greater than `tsc` at or after item `i + 1`
    fn next_greater(&self, i: usize, tsc: u64) -> Option<u64> {
        self.items[i + 1..]
            .iter()
            .map(|t| t.tsc)
            .find(|t| *t != 0 && *t > tsc)
    }

    /// First resolved timestamp greater than the given value anywhere
    fn next_greater_value(&self, tsc: u64) -> Option<u64> {
        self.items
            .iter()
            .map(|t| t.tsc)
            .find(|t| *t != 0 && *t > tsc)
    }

    /// Last resolved timestamp smaller than `tsc` before item `i`
    fn prev_smaller(&self, i: usize, tsc: u64) -> Option<u64> {
        self.items[..i]
            .iter()
            .rev()
            .map(|t| t.tsc)
            .find(|t| *t != 0 && *t < tsc)
    }
}
