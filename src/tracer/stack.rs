// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Call stack tracking

use log::debug;

use crate::types::Rva;

#[derive(Clone, Debug, Default)]
struct StackData {
    entries: Vec<Rva>,
    /// Net returns taken below the stack bottom
    offset: i64,
    low_water_mark: i64,
    peak: i64,
}

impl StackData {
    fn clear(&mut self) {
        self.entries.clear();
        self.offset = 0;
        self.peak = 0;
    }

    fn depth(&self) -> i64 {
        self.entries.len() as i64 + self.offset
    }
}

/// Stack of return addresses
///
/// Replay starts mid-execution, so returns can outnumber calls; the deficit
/// is tracked as a negative offset and its minimum is reported as the
/// low-water mark. While fast-forwarding through discarded output the stack
/// switches to a scratch overlay so the real stack survives.
#[derive(Clone, Debug, Default)]
pub struct CallStack {
    main: StackData,
    scratch: StackData,
    use_scratch: bool,
    max_span: i64,
}

impl CallStack {
    fn data(&self) -> &StackData {
        if self.use_scratch {
            &self.scratch
        } else {
            &self.main
        }
    }

    fn data_mut(&mut self) -> &mut StackData {
        if self.use_scratch {
            &mut self.scratch
        } else {
            &mut self.main
        }
    }

    pub fn push(&mut self, return_address: Rva) {
        let data = self.data_mut();
        data.entries.push(return_address);
        let grew = data.depth() > data.peak;
        if grew {
            data.peak = data.depth();
            self.check_span();
        }
    }

    /// Pop the most recent return address
    ///
    /// An empty stack adjusts the low-water mark instead: the return leaves
    /// the part of the call tree the replay started in.
    pub fn pop(&mut self) -> Option<Rva> {
        let data = self.data_mut();
        if let Some(address) = data.entries.pop() {
            return Some(address);
        }
        data.offset -= 1;
        let sank = data.offset < data.low_water_mark;
        if sank {
            data.low_water_mark = data.offset;
            self.check_span();
        }
        debug!("return with an empty call stack; adjusting low-water mark");
        None
    }

    pub fn depth(&self) -> i64 {
        self.data().depth()
    }

    pub fn low_water_mark(&self) -> i64 {
        self.data().low_water_mark
    }

    /// Return addresses, outermost first
    pub fn entries(&self) -> &[Rva] {
        &self.data().entries
    }

    /// Switch to the scratch overlay, clearing it
    pub fn enter_scratch(&mut self) {
        self.use_scratch = true;
        self.scratch.clear();
    }

    /// Switch back to the real stack
    pub fn leave_scratch(&mut self) {
        self.use_scratch = false;
    }

    fn check_span(&mut self) {
        let data = self.data();
        let span = data.peak - data.low_water_mark;
        if span > self.max_span {
            self.max_span = span;
            debug!("call stack span grew to {span}");
        }
    }
}
