// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Per-replay mutable state and record emission
//!
//! The output stream is line oriented; every record starts with `@ ` and a
//! marker byte. Timestamps are emitted lazily (only when they change) and
//! relative to the collection's earliest timestamp.

use std::io::{self, Write};

use crate::stats::RunStatistics;
use crate::types::{Rva, TscInterval, Tid};

use super::stack::CallStack;
use super::tnt::TntQueue;

/// Mutable state of one task's replay
pub struct Context<W> {
    pub tid: Tid,
    pub cpu: u32,
    /// Decoding cannot currently map the program counter to known code
    pub lost: bool,
    pub pc: Rva,
    /// Target of the packet being resolved (0 = none)
    pub tip: Rva,
    /// Pending deferred target (0 = none)
    pub fup: Rva,
    pub tsc: TscInterval,
    pub tnts: TntQueue,
    pub call_stack: CallStack,
    pub instruction_count: u64,
    pub entry_id: u32,
    /// A call record is owed once the callee is known
    pub pending_call: bool,
    /// Output is suppressed while replaying up to the block start
    pub fast_forward: bool,
    pub loop_count: u32,
    pub stats: RunStatistics,
    previously_output_tsc: u64,
    previously_output_count: u64,
    initial_tsc: u64,
    writer: W,
}

impl<W: Write> Context<W> {
    pub fn new(writer: W, initial_tsc: u64) -> Self {
        Self {
            tid: Tid(0),
            cpu: 0,
            lost: true,
            pc: 0,
            tip: 0,
            fup: 0,
            tsc: TscInterval::default(),
            tnts: TntQueue::default(),
            call_stack: CallStack::default(),
            instruction_count: 0,
            entry_id: 0,
            pending_call: false,
            fast_forward: false,
            loop_count: 0,
            stats: RunStatistics::default(),
            previously_output_tsc: 0,
            previously_output_count: 0,
            initial_tsc,
            writer,
        }
    }

    /// Give up on the current program counter
    pub fn get_lost(&mut self) {
        self.lost = true;
        self.tnts.clear();
    }

    /// Check whether all counted instructions have been flushed
    pub fn at_output_boundary(&self) -> bool {
        self.instruction_count == self.previously_output_count
    }

    pub(super) fn maybe_output_timestamp(&mut self) -> io::Result<()> {
        if self.previously_output_tsc != self.tsc.begin {
            if !self.fast_forward {
                writeln!(self.writer, "@ t {:x}", self.tsc.begin - self.initial_tsc)?;
            }
            self.previously_output_tsc = self.tsc.begin;
        }
        Ok(())
    }

    /// Emit a timestamp one tick in, keeping consecutive records unique
    fn force_output_timestamp(&mut self) -> io::Result<()> {
        if !self.fast_forward {
            writeln!(
                self.writer,
                "@ t {:x}",
                self.tsc.begin - self.initial_tsc + 1
            )?;
        }
        self.previously_output_tsc = self.tsc.begin + 1;
        Ok(())
    }

    pub fn output_schedule_in(&mut self) -> io::Result<()> {
        self.maybe_output_timestamp()?;
        if !self.fast_forward {
            writeln!(self.writer, "@ > {}", self.cpu)?;
        }
        Ok(())
    }

    pub fn output_schedule_out(&mut self) -> io::Result<()> {
        self.force_output_timestamp()?;
        if !self.fast_forward {
            writeln!(self.writer, "@ < {}", self.cpu)?;
        }
        Ok(())
    }

    pub fn output_module(&mut self, id: u32) -> io::Result<()> {
        self.maybe_output_timestamp()?;
        if !self.fast_forward {
            writeln!(self.writer, "@ x {id}")?;
        }
        Ok(())
    }

    /// Flush the instruction count against the given symbol id
    pub fn output_instructions_with(&mut self, id: u32) -> io::Result<()> {
        if !self.fast_forward {
            writeln!(
                self.writer,
                "@ e {} {} {}",
                self.call_stack.depth(),
                id,
                self.instruction_count - self.previously_output_count
            )?;
        }
        self.previously_output_count = self.instruction_count;
        Ok(())
    }

    /// Flush pending instructions against the current entry symbol
    pub fn output_instructions(&mut self) -> io::Result<()> {
        if self.instruction_count > self.previously_output_count {
            let id = self.entry_id;
            self.output_instructions_with(id)?;
        }
        self.maybe_output_timestamp()
    }

    /// Flush all but the most recent instruction
    fn output_previous_instructions(&mut self) -> io::Result<()> {
        self.instruction_count -= 1;
        self.output_instructions()?;
        self.instruction_count += 1;
        Ok(())
    }

    /// Flush instructions up to a call; the call itself is carried by the
    /// upcoming call record
    pub fn output_instructions_before_call(&mut self) -> io::Result<()> {
        self.output_previous_instructions()?;
        self.previously_output_count = self.instruction_count;
        Ok(())
    }

    pub fn output_call(&mut self, function_id: u32) -> io::Result<()> {
        if !self.fast_forward {
            writeln!(
                self.writer,
                "@ c {} {}",
                self.call_stack.depth() - 1,
                function_id
            )?;
        }
        Ok(())
    }

    pub fn output_iret(&mut self, address: Rva) -> io::Result<()> {
        self.output_previous_instructions()?;
        if !self.fast_forward {
            writeln!(
                self.writer,
                "@ r {} {:x} (iret)",
                self.call_stack.depth(),
                address
            )?;
        }
        self.previously_output_count = self.instruction_count;
        Ok(())
    }

    /// Emit a counter diagnostic (`@ ! <marker> <count>`)
    pub fn output_counter(&mut self, marker: char, count: u64) -> io::Result<()> {
        writeln!(self.writer, "@ ! {marker} {count}")
    }

    /// Emit a free-form diagnostic (`@ ! i<text>`)
    pub fn output_diagnostic(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.writer, "@ ! i{text}")
    }

    /// Echo one disassembled instruction (`@ d`)
    pub fn output_disassembly(&mut self, text: &str) -> io::Result<()> {
        if !self.fast_forward {
            writeln!(
                self.writer,
                "@ d {} {} {:x}: {}",
                self.cpu,
                self.call_stack.depth(),
                self.pc,
                text
            )?;
        }
        Ok(())
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}
