// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Scheduling correlation
//!
//! The sideband log records thread switches with a trace byte offset taken
//! by the capture driver, but that offset lags the packet stream: the
//! scheduler's branch target shows up in the trace *after* the OS has
//! already logged the switch. This module walks one CPU's packet stream,
//! matches every occurrence of the scheduler branch target against the
//! not-yet-earmarked switch points, and derives the per-thread timeline of
//! [`Quantum`]s from the earmarked result.


use log::{debug, error, warn};

use crate::packet::{self, Decoder, Packet};
use crate::sideband::Model;
use crate::timing::Timeline;
use crate::types::{Rva, TracePos, Tid};

/// How a switch point was bound to the trace
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncKind {
    /// Not yet bound
    #[default]
    None,
    /// Bound to a scheduler branch-target occurrence
    Branch,
    /// Provisionally bound to an overflow marker
    Overflow,
}

/// One sideband switch point, annotated during correlation
#[derive(Clone, Debug)]
pub struct SchedulingPoint {
    /// Reconciled timestamp; starts as the sideband's raw timestamp and is
    /// refined once the point is earmarked
    pub tsc: u64,
    /// Trace offset recorded by the capture driver
    pub recorded_offset: u64,
    /// Thread switched out
    pub prev: Tid,
    /// Thread switched in
    pub next: Tid,
    /// Trace offset of the matched occurrence
    pub matched_offset: TracePos,
    pub earmarked: bool,
    pub sync: SyncKind,
}

/// A contiguous timestamp range owned by one thread
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Quantum {
    pub tsc: (u64, u64),
    pub tid: Tid,
    /// Concrete trace offsets where known
    pub pos: (Option<TracePos>, Option<TracePos>),
}

/// Correlates one CPU's switch points with its packet stream
pub struct Correlator {
    points: Vec<SchedulingPoint>,
    scheduler_ip: Option<Rva>,
    initial_tid: Tid,
    initial_tsc: u64,
}

impl Correlator {
    /// Collect the switch points for one CPU from the sideband model
    pub fn new(model: &Model, cpu: u32) -> Self {
        let points = model
            .switches(cpu)
            .map(|s| SchedulingPoint {
                tsc: s.tsc,
                recorded_offset: s.trace_offset,
                prev: s.prev,
                next: s.next,
                matched_offset: 0,
                earmarked: false,
                sync: SyncKind::None,
            })
            .collect::<Vec<_>>();

        let initial_tid = model
            .initial_tid(cpu)
            .or_else(|| points.first().map(|p| p.prev))
            .unwrap_or(Tid(0));

        Self {
            points,
            scheduler_ip: model.scheduler_ip(),
            initial_tid,
            initial_tsc: model.initial_tsc(),
        }
    }

    /// Match scheduler branch-target occurrences against the switch points
    ///
    /// Walks the packet stream once. An indirect branch to the scheduler
    /// address earmarks the last switch point recorded before it; the final
    /// occurrence falls back to the last unearmarked point unconditionally.
    /// An overflow marker provisionally types points recorded at its offset
    /// (switches that happened while the hardware was dropping data leave
    /// no observable branch target).
    pub fn apply(&mut self, data: &[u8], timeline: &Timeline) -> Result<(), packet::Error> {
        let Some(scheduler_ip) = self.scheduler_ip else {
            warn!("no scheduler address in sideband; quanta will follow raw timestamps only");
            return Ok(());
        };

        let mut decoder = Decoder::new(data);
        loop {
            let packet = decoder.next_packet()?;
            match packet.kind {
                Packet::Tip(Some(address)) if address == scheduler_ip => {
                    self.earmark(packet.pos, timeline);
                }
                Packet::Ovf => self.mark_overflow(packet.pos),
                Packet::Eof => break,
                _ => (),
            }
        }
        Ok(())
    }

    fn earmark(&mut self, offset: TracePos, timeline: &Timeline) {
        let mut prev: Option<usize> = None;
        let mut found = false;

        for i in 0..self.points.len() {
            if self.points[i].recorded_offset > offset {
                match prev {
                    Some(p) if !self.points[p].earmarked => {
                        match timeline.bracket(offset) {
                            Some(bracket) => self.points[p].tsc = bracket.begin,
                            None => warn!("no reconciled timestamp at {offset:#x}"),
                        }
                        self.points[p].matched_offset = offset;
                        self.points[p].earmarked = true;
                        self.points[p].sync = SyncKind::Branch;
                        found = true;
                    }
                    _ => debug!("no switch point matches scheduler branch at {offset:#x}"),
                }
                break;
            }
            prev = Some(i);
        }

        // The final occurrence has no later switch point to scan up to;
        // bind it to the last remaining point unconditionally.
        if !found {
            if let Some(p) = prev {
                if self.points[p].recorded_offset < offset && !self.points[p].earmarked {
                    self.points[p].matched_offset = offset;
                    self.points[p].earmarked = true;
                    self.points[p].sync = SyncKind::Branch;
                }
            }
        }
    }

    fn mark_overflow(&mut self, offset: TracePos) {
        let mut prev: Option<usize> = None;

        for i in 0..self.points.len() {
            if self.points[i].recorded_offset == offset && !self.points[i].earmarked {
                // a wrongly linked branch match is corrected here, so the
                // point is typed without being earmarked
                self.points[i].matched_offset = offset;
                self.points[i].sync = SyncKind::Overflow;
                // several switches may fall into the same overflow
            } else if self.points[i].recorded_offset > offset {
                if let Some(p) = prev {
                    if self.points[p].sync == SyncKind::None {
                        self.points[p].matched_offset = offset;
                        self.points[p].sync = SyncKind::Overflow;
                    }
                }
                break;
            }
            prev = Some(i);
        }
    }

    /// Timestamp, offset and incoming thread of the first earmarked point
    pub fn first_quantum_start(&self) -> Option<(u64, TracePos, Tid)> {
        self.points
            .iter()
            .find(|p| p.earmarked)
            .map(|p| (p.tsc, p.matched_offset, p.next))
    }

    /// Produce the thread-ownership timeline from `first_tsc` onward
    ///
    /// The union of the returned quanta covers `[start, +infinity)` with no
    /// gaps and no overlaps; the final quantum is open-ended.
    pub fn quantums(&self, first_tsc: u64) -> Vec<Quantum> {
        let mut quanta = Vec::new();

        let mut prev_tsc = self.initial_tsc;
        let mut prev_has_pos = true;
        let mut prev_pos = 0;
        let mut prev_tid = self.initial_tid;
        let mut have_prev = false;

        for point in &self.points {
            if point.tsc > first_tsc {
                if !have_prev {
                    if self.initial_tsc <= first_tsc {
                        prev_tsc = self.initial_tsc;
                        prev_has_pos = false;
                        prev_pos = 0;
                        prev_tid = self.initial_tid;
                    } else {
                        // broken capture; keep going with what we have
                        error!("sideband initial timestamp is later than the first trace timestamp");
                        prev_tsc = first_tsc;
                        prev_has_pos = false;
                        prev_pos = 0;
                        prev_tid = self.initial_tid;
                    }
                    have_prev = true;
                }
                quanta.push(Quantum {
                    tsc: (prev_tsc, point.tsc),
                    tid: prev_tid,
                    pos: (
                        prev_has_pos.then_some(prev_pos),
                        point.earmarked.then_some(point.matched_offset),
                    ),
                });
            }

            prev_tsc = point.tsc;
            prev_has_pos = point.earmarked;
            prev_pos = point.matched_offset;
            prev_tid = point.next;
            have_prev = true;
        }

        if have_prev {
            quanta.push(Quantum {
                tsc: (prev_tsc, u64::MAX),
                tid: prev_tid,
                pos: (prev_has_pos.then_some(prev_pos), None),
            });
        }

        quanta
    }

    /// The annotated switch points in timestamp order
    pub fn points(&self) -> &[SchedulingPoint] {
        &self.points
    }
}
