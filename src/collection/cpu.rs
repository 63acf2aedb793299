// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Per-CPU block building
//!
//! Takes one CPU's coalesced timed blocks and clips, marks and splits them
//! along the scheduling quanta so that every surviving trace block belongs
//! to exactly one thread, bracketed by schedule-in/out markers.

use log::warn;

use crate::sched::{Correlator, Quantum};
use crate::timing::Timeline;
use crate::types::Tid;

use super::task::{Block, BlockKind};
use super::Error;

/// Build the thread-attributed block list for one CPU
pub fn build_blocks(
    cpu: u32,
    timeline: &Timeline,
    correlator: &Correlator,
) -> Result<Vec<Block>, Error> {
    let mut blocks: Vec<Block> = timeline
        .timed_blocks()
        .into_iter()
        .filter(|b| b.has_tsc)
        .map(|b| Block {
            kind: BlockKind::Trace,
            pos: b.pos,
            tsc: b.tsc,
            has_tid: false,
            tid: Tid(0),
            cpu,
            sync_start: 0,
        })
        .collect();

    let (quantum_tsc, quantum_pos, quantum_tid) = correlator
        .first_quantum_start()
        .ok_or(Error::NoFirstQuantum { cpu })?;

    // throw away blocks that end before the first quantum starts
    let before = blocks
        .iter()
        .take_while(|b| quantum_tsc >= b.tsc.1)
        .count();
    blocks.drain(..before);

    if let Some(first) = blocks.first_mut() {
        if quantum_tsc > first.tsc.0 {
            // clip the part before the first quantum
            first.tsc.0 = quantum_tsc;
            first.pos.0 = quantum_pos;
            first.has_tid = true;
            first.tid = quantum_tid;
            first.sync_start = timeline.last_sync(quantum_pos);
        }
    } else {
        warn!("no usable timed blocks for cpu {cpu}");
    }

    let first_tsc = blocks.first().map(|b| b.tsc.0).unwrap_or(quantum_tsc);
    let mut cursor = 0usize;

    for quantum in correlator.quantums(first_tsc) {
        cursor = apply_quantum(&mut blocks, cursor, &quantum, timeline, cpu);
    }

    Ok(blocks)
}

/// Attribute blocks overlapping one quantum, splitting at its boundaries
fn apply_quantum(
    blocks: &mut Vec<Block>,
    mut cursor: usize,
    quantum: &Quantum,
    timeline: &Timeline,
    cpu: u32,
) -> usize {
    let start_pos = quantum.pos.0.unwrap_or(0);
    let sync_start = timeline.last_sync(start_pos);
    let sync_tsc = timeline
        .bracket(sync_start)
        .map(|b| b.begin)
        .unwrap_or(quantum.tsc.0);
    blocks.insert(
        cursor,
        Block {
            kind: BlockKind::ScheduleIn,
            pos: (start_pos, start_pos),
            tsc: (sync_tsc, sync_tsc),
            has_tid: true,
            tid: quantum.tid,
            cpu,
            sync_start,
        },
    );
    cursor += 1;

    while cursor < blocks.len() {
        if let Some(end_pos) = quantum.pos.1 {
            // the quantum end has a concrete trace offset
            while cursor < blocks.len() && end_pos >= blocks[cursor].pos.1 {
                own(&mut blocks[cursor], quantum.tid, timeline);
                cursor += 1;
            }
            if cursor >= blocks.len() {
                break;
            }
            if blocks[cursor].pos.0 < end_pos {
                // block straddles the quantum end; split at the offset
                let old = blocks[cursor].clone();
                let tail = Block {
                    kind: BlockKind::Trace,
                    pos: (end_pos, old.pos.1),
                    tsc: (quantum.tsc.1, old.tsc.1),
                    has_tid: old.has_tid,
                    tid: old.tid,
                    cpu,
                    sync_start: timeline.last_sync(end_pos),
                };
                blocks[cursor].pos.1 = end_pos;
                blocks[cursor].tsc.1 = quantum.tsc.1;
                own(&mut blocks[cursor], quantum.tid, timeline);
                cursor += 1;
                blocks.insert(cursor, tail);
                // the tail is re-examined against the same quantum
            } else {
                break;
            }
        } else {
            // no concrete offset; fast-forward by timestamps
            while cursor < blocks.len() && quantum.tsc.1 >= blocks[cursor].tsc.1 {
                own(&mut blocks[cursor], quantum.tid, timeline);
                cursor += 1;
            }
            if cursor >= blocks.len() {
                break;
            }
            if blocks[cursor].tsc.0 >= quantum.tsc.1 {
                break;
            }

            // find the split offset by walking resolved timestamps
            let block = blocks[cursor].clone();
            let mut p = block.pos.0;
            let mut t = 0;
            let mut t_prev = block.tsc.0;
            let mut first_end = p;
            let mut second_begin = p;
            while p < block.pos.1 {
                let Some((np, nt)) = timeline.next_resolved(p) else {
                    break;
                };
                p = np;
                t = nt;
                if t <= quantum.tsc.1 {
                    first_end = p;
                    t_prev = t;
                }
                if t >= quantum.tsc.1 {
                    second_begin = p;
                    break;
                }
            }

            if t == 0 {
                // no resolved timestamp inside the block; nothing to split on
                warn!(
                    "cpu {cpu}: block at {:#x} has no resolved timestamps",
                    block.pos.0
                );
                break;
            }

            let splits_in_two = first_end > block.pos.0
                && first_end < block.pos.1
                && second_begin >= first_end
                && second_begin < block.pos.1;
            if splits_in_two {
                let tail = Block {
                    kind: BlockKind::Trace,
                    pos: (second_begin, block.pos.1),
                    tsc: (t, block.tsc.1),
                    has_tid: block.has_tid,
                    tid: block.tid,
                    cpu,
                    sync_start: timeline.last_sync(second_begin),
                };
                blocks[cursor].pos.1 = first_end;
                blocks[cursor].tsc.1 = t_prev;
                own(&mut blocks[cursor], quantum.tid, timeline);
                cursor += 1;
                blocks.insert(cursor, tail);
            } else if first_end > block.pos.0 && first_end < block.pos.1 {
                // everything up to the split belongs to this quantum
                blocks[cursor].pos.1 = first_end;
                own(&mut blocks[cursor], quantum.tid, timeline);
                break;
            } else {
                // the block belongs entirely to a later quantum
                blocks[cursor] = Block {
                    kind: BlockKind::Trace,
                    pos: (second_begin, block.pos.1),
                    tsc: (t, block.tsc.1),
                    has_tid: block.has_tid,
                    tid: block.tid,
                    cpu,
                    sync_start: timeline.last_sync(second_begin),
                };
            }
        }
    }

    // only emit a schedule-out when the precise end time is known
    if quantum.tsc.1 != u64::MAX {
        let end_pos = quantum.pos.1.unwrap_or(0);
        blocks.insert(
            cursor,
            Block {
                kind: BlockKind::ScheduleOut,
                pos: (end_pos, end_pos),
                tsc: (quantum.tsc.1, quantum.tsc.1),
                has_tid: true,
                tid: quantum.tid,
                cpu,
                sync_start: end_pos,
            },
        );
        cursor += 1;
    }

    cursor
}

fn own(block: &mut Block, tid: Tid, timeline: &Timeline) {
    block.tid = tid;
    block.has_tid = true;
    block.sync_start = timeline.last_sync(block.pos.0);
}
