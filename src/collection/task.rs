// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Per-thread work items

use std::io::{self, Write};

use crate::types::{TracePos, Tid};

use super::{dequote, quote, Error, TaggedLines};

/// What a block tells the replay driver to do
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Replay trace bytes
    Trace,
    /// A range that could not be reconstructed
    Bad,
    /// The thread was scheduled onto the CPU
    ScheduleIn,
    /// The thread was scheduled off the CPU
    ScheduleOut,
}

/// A contiguous piece of one CPU's trace assigned to one thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub pos: (TracePos, TracePos),
    pub tsc: (u64, u64),
    pub has_tid: bool,
    pub tid: Tid,
    pub cpu: u32,
    /// Last decoder start point at or before the block start; replay seeks
    /// here and fast-forwards to the block start
    pub sync_start: TracePos,
}

/// All blocks of one traced thread, across CPUs, in timestamp order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    tid: Tid,
    name: String,
    blocks: Vec<Block>,
    size: u64,
}

impl Task {
    pub fn new(tid: Tid, name: impl Into<String>) -> Self {
        Self {
            tid,
            name: name.into(),
            blocks: Vec::new(),
            size: 0,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of replayable trace bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn append_block(&mut self, block: Block) {
        if block.kind == BlockKind::Trace {
            self.size += block.pos.1 - block.pos.0;
        }
        self.blocks.push(block);
    }

    /// First known timestamp of the task, if any
    pub fn earliest_tsc(&self) -> Option<u64> {
        self.blocks
            .first()
            .map(|b| b.tsc.0)
            .filter(|tsc| *tsc != 0)
    }

    pub(super) fn serialize(&self, out: &mut impl Write) -> io::Result<()> {
        let trace_blocks = self
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Trace)
            .count();
        writeln!(out, "task {} {}", self.tid, quote(&self.name))?;
        writeln!(out, "  # {trace_blocks} trace blocks:")?;
        for b in &self.blocks {
            match b.kind {
                BlockKind::Trace => writeln!(
                    out,
                    "  block {} {:x} {:x} {:x} {:x} {:x}",
                    b.cpu, b.tsc.0, b.tsc.1, b.pos.0, b.pos.1, b.sync_start
                )?,
                BlockKind::ScheduleIn => {
                    writeln!(out, "  enter {} {:x}", b.cpu, b.tsc.0)?
                }
                BlockKind::ScheduleOut => {
                    writeln!(out, "  leave {} {:x}", b.cpu, b.tsc.1)?
                }
                BlockKind::Bad => {
                    writeln!(out, "  bad   {} {:x} {:x}", b.cpu, b.tsc.0, b.tsc.1)?
                }
            }
        }
        Ok(())
    }

    /// Parse one task and its block lines
    ///
    /// Consumes lines until a tag that does not belong to a task; that tag
    /// is handed back to the caller alongside the task.
    pub(super) fn deserialize(
        lines: &mut TaggedLines<impl Iterator<Item = io::Result<String>>>,
        first_line: &str,
    ) -> Result<(Self, Option<(String, String)>), Error> {
        let mut parts = first_line.splitn(2, ' ');
        let tid = parts
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| Error::Syntax("task id".into()))?;
        let name = dequote(parts.next().unwrap_or(""))
            .ok_or_else(|| Error::Syntax("task name".into()))?;
        let mut task = Task::new(Tid(tid), name);

        loop {
            let Some((tag, rest)) = lines.next_tagged()? else {
                return Ok((task, None));
            };
            let block = match tag.as_str() {
                "block" => {
                    let f = hex_fields(&rest, 6)?;
                    Block {
                        kind: BlockKind::Trace,
                        pos: (f[3], f[4]),
                        tsc: (f[1], f[2]),
                        has_tid: true,
                        tid: task.tid,
                        cpu: f[0] as u32,
                        sync_start: f[5],
                    }
                }
                "enter" => {
                    let f = hex_fields(&rest, 2)?;
                    Block {
                        kind: BlockKind::ScheduleIn,
                        pos: (0, 0),
                        tsc: (f[1], f[1]),
                        has_tid: true,
                        tid: task.tid,
                        cpu: f[0] as u32,
                        sync_start: 0,
                    }
                }
                "leave" => {
                    let f = hex_fields(&rest, 2)?;
                    Block {
                        kind: BlockKind::ScheduleOut,
                        pos: (0, 0),
                        tsc: (f[1], f[1]),
                        has_tid: true,
                        tid: task.tid,
                        cpu: f[0] as u32,
                        sync_start: 0,
                    }
                }
                "bad" => {
                    let f = hex_fields(&rest, 3)?;
                    Block {
                        kind: BlockKind::Bad,
                        pos: (0, 0),
                        tsc: (f[1], f[2]),
                        has_tid: true,
                        tid: task.tid,
                        cpu: f[0] as u32,
                        sync_start: 0,
                    }
                }
                _ => return Ok((task, Some((tag, rest)))),
            };
            task.append_block(block);
        }
    }
}

/// Parse whitespace-separated fields; the first is decimal, the rest hex
fn hex_fields(line: &str, n: usize) -> Result<Vec<u64>, Error> {
    let mut fields = Vec::with_capacity(n);
    for (i, word) in line.split_whitespace().take(n).enumerate() {
        let value = if i == 0 {
            word.parse::<u64>().ok()
        } else {
            u64::from_str_radix(word, 16).ok()
        };
        fields.push(value.ok_or_else(|| Error::Syntax(format!("block field '{word}'")))?);
    }
    if fields.len() != n {
        return Err(Error::Syntax("missing block fields".into()));
    }
    Ok(fields)
}
