// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Execution-model replay
//!
//! This module provides the [`Replay`] engine. Positioned at a sync point
//! of one CPU's packet stream, it replays control flow instruction by
//! instruction using external disassembly, maintains a call stack, and
//! emits the normalized instruction/call/module record stream described in
//! [`context`].
//!
//! A replay is driven one [`Task`] at a time through
//! [`run_task`][Replay::run_task]: trace blocks replay packets between
//! their bounds (fast-forwarding from the preceding sync point with output
//! suppressed), schedule blocks emit the switch records. Loss of
//! synchronization is not an error; the engine emits a synthetic marker and
//! scans on until the trace resumes with a known program counter.

pub mod context;
pub mod stack;
pub mod tnt;

mod exec;


pub use context::Context;
pub use stack::CallStack;
pub use tnt::TntQueue;

use std::io::{self, Write};

use log::{debug, error, trace, warn};

use crate::binary::kernel::KernelMap;
use crate::binary::Source;
use crate::collection::{Block, BlockKind, Task};
use crate::packet::{Decoder, Packet, TracePacket};
use crate::sideband::Model;
use crate::symbols::Table;
use crate::timing::Timeline;
use crate::types::{Rva, TracePos, TscInterval, Tid};

/// Call-stack depth that triggers the one-time diagnostic dump
const DEEP_STACK_MARK: i64 = 100;

/// Default revisit count before a loop is flagged as possibly
/// non-terminating
pub const LOOP_THRESHOLD: u32 = 500;

/// Tunable replay behavior
#[derive(Clone, Debug)]
pub struct ReplayOptions {
    /// Echo disassembled instructions into the output stream
    pub show_disassembly: bool,
    /// Revisit count before the loop diagnostic fires
    pub loop_threshold: u32,
    /// Give up on the current quantum when the loop diagnostic fires
    /// instead of only logging
    pub loop_abort: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            show_disassembly: false,
            loop_threshold: LOOP_THRESHOLD,
            loop_abort: false,
        }
    }
}

/// Everything the replay consults but does not own per-task
pub(crate) struct World<'a, S> {
    model: &'a Model,
    timelines: &'a [Timeline],
    kernel_map: Option<&'a KernelMap>,
    kernel_image: Option<String>,
    source: S,
    symbols: Table,
    executables: Table,
    host_executables: Option<crate::symbols::SharedTable>,
}

impl<S: Source> World<'_, S> {
    /// Map a program counter to a binary and load address
    ///
    /// Kernel addresses resolve through the kernel map and the fixed kernel
    /// image; user addresses through the sideband mmap timeline. The third
    /// element is a symbol hint for addresses the kernel map already named.
    fn resolve_code_location(
        &self,
        pc: Rva,
        tsc: u64,
        tid: Tid,
    ) -> Option<(String, Rva, Option<String>)> {
        if let Some(kernel) = self.kernel_map {
            if let Some((name, _)) = kernel.function_at(pc) {
                let image = self.kernel_image.clone()?;
                return Some((image, 0, Some(name.to_string())));
            }
        }
        self.model
            .target_path(tid, pc, tsc)
            .map(|(path, start)| (path.to_string(), start, None))
    }

    /// Resolve a loader-patched relocation to its real target
    ///
    /// Asks the current binary for the symbolic name, then scans every
    /// binary mapped for the thread at this time for a matching export.
    fn resolve_relocation(&mut self, tid: Tid, tsc: u64, target: Rva) -> Option<Rva> {
        let (path, start) = self
            .model
            .target_path(tid, target, tsc)
            .map(|(p, s)| (p.to_string(), s))?;
        let name = self.source.obtain(&path, start)?.relocation_at(target)?;
        debug!("resolving relocation '{name}'");

        let mut candidates = Vec::new();
        self.model.for_each_target_path(tid, tsc, |p, s| {
            candidates.push((p.to_string(), s));
            false
        });
        for (path, start) in candidates {
            if let Some(handle) = self.source.obtain(&path, start) {
                if let Some(address) = handle.global_function(&name) {
                    debug!("found '{name}' in {path} at {address:#x}");
                    return Some(address);
                }
            }
        }
        None
    }

    /// Best-effort symbolic name for an address
    fn symbol_name(&mut self, address: Rva, tsc: u64, tid: Tid) -> String {
        if let Some(kernel) = self.kernel_map {
            if let Some((name, _)) = kernel.function_at(address) {
                return name.to_string();
            }
        }
        if let Some((path, start)) = self
            .model
            .target_path(tid, address, tsc)
            .map(|(p, s)| (p.to_string(), s))
        {
            if let Some(handle) = self.source.obtain(&path, start) {
                if let Some((name, _)) = handle.function_at(address) {
                    return name;
                }
            }
        }
        "unknown".into()
    }
}

/// The replay engine for one worker
///
/// Created through a [`Builder`]; replays one task at a time.
pub struct Replay<'a, W, S> {
    ctx: Context<W>,
    world: World<'a, S>,
    options: ReplayOptions,
    in_psb: bool,
    in_ovf: bool,
    stack_dumped: bool,
    current_module: Option<(String, Rva)>,
}

impl<'a, W: Write, S: Source> Replay<'a, W, S> {
    /// Replay all of one task's blocks
    ///
    /// `traces` holds the raw per-CPU trace files, indexed by CPU. Returns
    /// whether every trace block was replayed to its end.
    pub fn run_task(&mut self, task: &Task, traces: &[Vec<u8>]) -> io::Result<bool> {
        self.ctx.tid = task.tid();
        let mut complete = true;

        for block in task.blocks() {
            self.ctx.cpu = block.cpu;
            match block.kind {
                BlockKind::Trace => {
                    let Some(data) = traces.get(block.cpu as usize) else {
                        warn!("no trace data for cpu {}", block.cpu);
                        complete = false;
                        continue;
                    };
                    if !self.run_block(data, block)? {
                        complete = false;
                    }
                }
                BlockKind::ScheduleIn => {
                    self.ctx.tsc = TscInterval::new(block.tsc.0, block.tsc.1);
                    self.ctx.output_schedule_in()?;
                }
                BlockKind::ScheduleOut => {
                    self.ctx.tsc = TscInterval::new(block.tsc.0, block.tsc.1);
                    self.ctx.output_schedule_out()?;
                }
                BlockKind::Bad => (),
            }
        }

        if !complete {
            self.ctx.stats.incomplete_tasks += 1;
        }
        Ok(complete)
    }

    /// Replay one trace block
    ///
    /// Decoding starts at the block's sync point with output suppressed and
    /// the call stack on its scratch overlay; real output resumes at the
    /// block start with a consistent stack.
    fn run_block(&mut self, data: &[u8], block: &Block) -> io::Result<bool> {
        let begin = block.sync_start.min(data.len() as TracePos);
        let end = block.pos.1.min(data.len() as TracePos);
        let start = block.pos.0;
        if begin > start || start > end {
            warn!(
                "cpu {}: unusable block bounds [{begin:#x}, {start:#x}, {end:#x})",
                block.cpu
            );
            return Ok(false);
        }

        let mut decoder =
            Decoder::new(&data[begin as usize..end as usize]).at_offset(begin);

        self.ctx.fast_forward = true;
        self.ctx.call_stack.enter_scratch();
        let mut fast_forward = true;

        loop {
            let at = decoder.pos();
            let now = at < start;
            if now != fast_forward {
                self.set_fast_forward(now, at)?;
                fast_forward = now;
            }

            let packet = match decoder.next_packet() {
                Ok(packet) => packet,
                Err(e) => {
                    error!("cpu {}: {e}", block.cpu);
                    self.ctx.stats.skipped_bytes += end.saturating_sub(e.pos());
                    return Ok(false);
                }
            };
            if self.process(&packet)? {
                return Ok(true);
            }
        }
    }

    /// Feed one packet to the state machine
    ///
    /// Returns `true` once the end of the stream is reached.
    pub fn process(&mut self, packet: &TracePacket) -> io::Result<bool> {
        match &packet.kind {
            Packet::ShortTnt(tnt) | Packet::LongTnt(tnt) => {
                trace!("{:#x}: {} branch bits", packet.pos, tnt.len());
                self.ctx.tnts.append(*tnt);
            }
            Packet::Tip(address) => self.branch_target(packet.pos, address.unwrap_or(0))?,
            Packet::TipPgd(_) => self.trace_disable()?,
            Packet::TipPge(address) => self.trace_resume(packet.pos, address.unwrap_or(0)),
            Packet::Fup(address) => self.deferred_target(address.unwrap_or(0)),
            Packet::Tsc(_) | Packet::Mtc(_) => self.timing(packet.pos),
            Packet::Psb => self.in_psb = true,
            Packet::Psbend => self.sync_end(),
            Packet::Ovf => self.overflow(packet.pos)?,
            Packet::Eof => return Ok(true),
            _ => trace!("{:#x}: {:?}", packet.pos, packet.kind),
        }
        Ok(false)
    }

    /// Replay statistics accumulated so far
    pub fn statistics(&self) -> crate::stats::RunStatistics {
        self.ctx.stats
    }

    /// Lowest call-stack level reached, in returns below the start point
    pub fn stack_low_water_mark(&self) -> i64 {
        self.ctx.call_stack.low_water_mark()
    }

    /// The replay context, mostly useful for inspection in tests
    pub fn context(&self) -> &Context<W> {
        &self.ctx
    }

    /// Whether the one-time deep-stack dump has fired
    pub(crate) fn stack_dump_emitted(&self) -> bool {
        self.stack_dumped
    }

    /// Interleave a free-form diagnostic into the output stream
    pub fn diagnostic(&mut self, text: &str) -> io::Result<()> {
        self.ctx.output_diagnostic(text)
    }

    /// Surface the accumulated counters as end-of-run diagnostics
    pub fn report_statistics(&mut self) -> io::Result<()> {
        let stats = self.ctx.stats;
        if stats.overflows != 0 {
            self.ctx.output_diagnostic(&format!(
                "WARNING: there were {} trace buffer overflows",
                stats.overflows
            ))?;
        }
        if stats.skipped_bytes != 0 {
            self.ctx.output_diagnostic(&format!(
                "WARNING: {} bytes of trace input were not parsable",
                stats.skipped_bytes
            ))?;
        }
        Ok(())
    }

    fn branch_target(&mut self, pos: TracePos, address: Rva) -> io::Result<()> {
        debug!("{pos:#x}: branch target {address:#x}");
        self.ctx.tip = address;
        if self.in_ovf {
            self.ctx.pc = address;
            self.in_ovf = false;
        }
        if self.ctx.lost {
            debug!("lost; nothing to validate the branch target against");
        } else {
            self.execute_until_packet()?;
        }
        Ok(())
    }

    fn trace_disable(&mut self) -> io::Result<()> {
        if !self.ctx.lost && self.ctx.fup != 0 {
            self.execute_until_packet()?;
        }
        Ok(())
    }

    fn trace_resume(&mut self, pos: TracePos, address: Rva) {
        debug!("{pos:#x}: trace resumes at {address:#x}");
        self.refresh_tsc(pos);
        self.ctx.pc = address;
        self.ctx.fup = 0;
        self.ctx.tnts.clear();
        self.ctx.lost = false;
        self.in_ovf = false;
    }

    fn deferred_target(&mut self, address: Rva) {
        if self.in_ovf {
            debug!("starting point after overflow: {address:#x}");
            self.ctx.pc = address;
            self.in_ovf = false;
        } else if self.in_psb {
            self.ctx.pc = address;
        } else if !self.ctx.lost {
            self.ctx.fup = address;
        }
    }

    fn timing(&mut self, pos: TracePos) {
        let before = self.ctx.tsc.begin;
        self.refresh_tsc(pos);
        if self.ctx.tsc.begin < before {
            // best-effort reconciliation; keep going with the stale value
            error!(
                "cpu {} at {pos:#x}: timestamp steps back ({before:#x} -> {:#x})",
                self.ctx.cpu, self.ctx.tsc.begin
            );
        }
    }

    fn sync_end(&mut self) {
        self.in_psb = false;
        if !self.ctx.lost && !self.ctx.tnts.is_empty() {
            warn!("branch bits pending at end of sync bracket");
        }
        self.ctx.lost = false;
        self.ctx.tnts.clear();
    }

    fn overflow(&mut self, pos: TracePos) -> io::Result<()> {
        debug!("{pos:#x}: overflow");
        self.in_ovf = true;
        self.in_psb = false;
        self.ctx.stats.overflows += 1;
        self.ctx.tnts.clear();
        self.ctx.fup = 0;
        self.ctx.lost = false;
        let count = self.ctx.stats.overflows;
        self.output_lost("overflow", count)?;
        self.refresh_tsc(pos);
        Ok(())
    }

    fn refresh_tsc(&mut self, pos: TracePos) {
        let timeline = self.world.timelines.get(self.ctx.cpu as usize);
        if let Some(bracket) = timeline.and_then(|t| t.bracket(pos)) {
            self.ctx.tsc = bracket;
        }
    }

    fn set_fast_forward(&mut self, state: bool, pos: TracePos) -> io::Result<()> {
        if state {
            debug!("fast-forward starts");
            self.ctx.fast_forward = true;
            self.ctx.call_stack.enter_scratch();
        } else {
            debug!("fast-forward ends");
            self.ctx.fast_forward = false;
            self.ctx.call_stack.leave_scratch();
            self.refresh_tsc(pos);
            self.ctx.maybe_output_timestamp()?;
        }
        Ok(())
    }

    /// Emit a synthetic marker for a stretch with no trustworthy flow
    fn output_lost(&mut self, symbol: &str, count: u64) -> io::Result<()> {
        let Self { ctx, world, .. } = self;
        ctx.output_instructions()?;
        let (id, _) = world.symbols.intern(symbol)?;
        // one synthetic instruction so the marker gets a unique spot
        ctx.instruction_count += 1;
        ctx.output_instructions_with(id)?;
        ctx.output_counter(symbol.chars().next().unwrap_or('?'), count)
    }

    /// Execute instructions until the current packet is consumed
    fn execute_until_packet(&mut self) -> io::Result<()> {
        if self.ctx.call_stack.depth() == DEEP_STACK_MARK && !self.stack_dumped {
            self.dump_stack();
            self.stack_dumped = true;
        }

        let mut done = false;
        while !self.ctx.lost && !done {
            let tid = self.ctx.tid;
            let tsc = self.ctx.tsc.begin;

            let Some((path, load_address, kernel_symbol)) =
                self.world.resolve_code_location(self.ctx.pc, tsc, tid)
            else {
                debug!("no code identity at {:#x}", self.ctx.pc);
                self.ctx.get_lost();
                break;
            };

            let module_changed = self
                .current_module
                .as_ref()
                .map(|(p, l)| *p != path || *l != load_address)
                .unwrap_or(true);

            if self.ctx.at_output_boundary() || self.ctx.pending_call || module_changed {
                let entry_symbol = {
                    let Self { ctx, world, .. } = self;
                    match world.source.obtain(&path, load_address) {
                        Some(handle) => handle.function_at(ctx.pc).map(|(name, _)| name),
                        None => {
                            debug!("no disassembler for {path}");
                            ctx.get_lost();
                            break;
                        }
                    }
                }
                .or(kernel_symbol)
                .unwrap_or_else(|| "unknown".into());
                let (entry_id, _) = self.world.symbols.intern(&entry_symbol)?;

                if self.ctx.pending_call {
                    self.ctx.output_call(entry_id)?;
                    self.ctx.pending_call = false;
                }

                if module_changed {
                    self.ctx.output_instructions()?;
                    let (module_id, new_module) = self.world.executables.intern(&path)?;
                    if new_module {
                        // remember where the binary was found on this host
                        if let Some(host_path) = self.world.source.host_location(&path) {
                            if let Some(host) = self.world.host_executables.as_mut() {
                                host.record(module_id, &host_path)?;
                            }
                        }
                    }
                    self.ctx.output_module(module_id)?;
                }

                self.ctx.entry_id = entry_id;
            }
            self.current_module = Some((path.clone(), load_address));

            let entry_pc = self.ctx.pc;
            let mut previous_pc = self.ctx.pc;
            loop {
                let insn = {
                    let Self { ctx, world, .. } = self;
                    match world.source.obtain(&path, load_address).map(|h| h.decode(ctx.pc)) {
                        Some(Ok(insn)) => insn,
                        Some(Err(e)) => {
                            debug!("cannot disassemble {:#x}: {e}", ctx.pc);
                            ctx.get_lost();
                            done = true;
                            break;
                        }
                        None => {
                            ctx.get_lost();
                            done = true;
                            break;
                        }
                    }
                };
                self.ctx.instruction_count += 1;
                if self.options.show_disassembly {
                    self.ctx.output_disassembly(&insn.text)?;
                }

                let next_address = insn.next;
                previous_pc = self.ctx.pc;
                done = {
                    let Self { ctx, world, .. } = self;
                    exec::execute_tip(&insn, ctx, &mut |target| {
                        world.resolve_relocation(tid, tsc, target)
                    })?
                };
                // staying on the straight line means the packet is still
                // unresolved and the next instruction is adjacent
                if done || self.ctx.pc != next_address {
                    break;
                }
            }

            if !done && !self.ctx.lost && entry_pc <= self.ctx.pc && self.ctx.pc <= previous_pc {
                self.ctx.loop_count += 1;
                if self.ctx.loop_count > self.options.loop_threshold {
                    debug!("possible non-terminating loop at {:#x}", self.ctx.pc);
                    if self.options.loop_abort {
                        self.ctx
                            .output_diagnostic("POSSIBLE NON-TERMINATING LOOP; GIVING UP")?;
                        self.ctx.get_lost();
                    }
                    self.ctx.loop_count = 0;
                }
            } else {
                self.ctx.loop_count = 0;
            }

            if self.ctx.lost {
                self.ctx.stats.lost_segments += 1;
                let count = self.ctx.stats.lost_segments;
                self.output_lost("lost", count)?;
            }
        }

        if self.ctx.pending_call {
            let pc = self.ctx.pc;
            let tsc = self.ctx.tsc.begin;
            let tid = self.ctx.tid;
            let name = self.world.symbol_name(pc, tsc, tid);
            let (id, _) = self.world.symbols.intern(&name)?;
            self.ctx.output_call(id)?;
            self.ctx.pending_call = false;
        }

        Ok(())
    }

    fn dump_stack(&mut self) {
        warn!("call stack has grown suspiciously deep:");
        let tsc = self.ctx.tsc.begin;
        let tid = self.ctx.tid;
        let entries: Vec<Rva> = self.ctx.call_stack.entries().to_vec();
        for address in entries {
            let name = self.world.symbol_name(address, tsc, tid);
            warn!("  {address:#x} {name}");
        }
    }
}

/// Builder for [`Replay`]
///
/// A builder configures one worker's engine: the shared read-only inputs,
/// the disassembler source and the interning tables.
pub struct Builder<'a, S> {
    model: &'a Model,
    timelines: &'a [Timeline],
    kernel_map: Option<&'a KernelMap>,
    kernel_image: Option<String>,
    source: S,
    symbols: Table,
    executables: Table,
    host_executables: Option<crate::symbols::SharedTable>,
    initial_tsc: u64,
    options: ReplayOptions,
}

/// Create a new [`Builder`]
pub fn builder<'a>(model: &'a Model, timelines: &'a [Timeline]) -> Builder<'a, ()> {
    Builder {
        model,
        timelines,
        kernel_map: None,
        kernel_image: None,
        source: (),
        symbols: Table::default(),
        executables: Table::default(),
        host_executables: None,
        initial_tsc: 0,
        options: ReplayOptions::default(),
    }
}

impl<'a, S> Builder<'a, S> {
    /// Build with the given disassembler [`Source`]
    pub fn with_source<T>(self, source: T) -> Builder<'a, T> {
        Builder {
            model: self.model,
            timelines: self.timelines,
            kernel_map: self.kernel_map,
            kernel_image: self.kernel_image,
            source,
            symbols: self.symbols,
            executables: self.executables,
            host_executables: self.host_executables,
            initial_tsc: self.initial_tsc,
            options: self.options,
        }
    }

    /// Resolve kernel addresses against the given map and image
    pub fn with_kernel(mut self, map: &'a KernelMap, image: impl Into<String>) -> Self {
        self.kernel_map = Some(map);
        self.kernel_image = Some(image.into());
        self
    }

    /// Intern function symbols into the given table
    pub fn with_symbol_table(mut self, table: Table) -> Self {
        self.symbols = table;
        self
    }

    /// Intern binary paths into the given table
    pub fn with_executable_table(mut self, table: Table) -> Self {
        self.executables = table;
        self
    }

    /// Also record host paths of binaries under their module ids
    pub fn with_host_executable_table(mut self, table: crate::symbols::SharedTable) -> Self {
        self.host_executables = Some(table);
        self
    }

    /// Timestamps in the output are relative to this value
    pub fn with_initial_tsc(mut self, tsc: u64) -> Self {
        self.initial_tsc = tsc;
        self
    }

    pub fn with_options(mut self, options: ReplayOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the [`Replay`] writing records to `writer`
    pub fn build<W: Write>(self, writer: W) -> Replay<'a, W, S>
    where
        S: Source,
    {
        Replay {
            ctx: Context::new(writer, self.initial_tsc),
            world: World {
                model: self.model,
                timelines: self.timelines,
                kernel_map: self.kernel_map,
                kernel_image: self.kernel_image,
                source: self.source,
                symbols: self.symbols,
                executables: self.executables,
                host_executables: self.host_executables,
            },
            options: self.options,
            in_psb: false,
            in_ovf: false,
            stack_dumped: false,
            current_module: None,
        }
    }
}
