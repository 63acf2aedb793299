// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Disassembler seam
//!
//! Replay needs to know, for any program counter, what instruction sits
//! there and how it transfers control. This module defines the
//! [`Disassembler`] trait used by the [`tracer`][crate::tracer] for that
//! purpose, along with a number of types implementing it:
//!
//! * adapters such as [`from_fn`] and [`from_sorted_map`] that allow
//!   defining disassemblers from a wide range of data sources, mostly
//!   useful for tests and embedders,
//! * an [`either::Either`] impl for combining two disassembler types at one
//!   seam, and
//! * the [`elf::ElfDisassembler`], which decodes instructions from a real
//!   binary's executable segments.
//!
//! [`Source`] abstracts the "give me a disassembler for this binary at this
//! load address" step; [`elf::ElfRegistry`] is its production
//! implementation, caching handles keyed by binary identity.

pub mod elf;
pub mod kernel;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::types::Rva;

/// Control-flow classification of one decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// No control transfer
    Other,
    DirectJump(Rva),
    DirectConditional(Rva),
    DirectCall(Rva),
    IndirectJump,
    IndirectCall,
    Return,
    Syscall,
    InterruptReturn,
}

/// One decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the following instruction
    pub next: Rva,
    pub kind: Kind,
    /// Textual form for diagnostic output
    pub text: String,
}

impl Instruction {
    pub fn new(next: Rva, kind: Kind, text: impl Into<String>) -> Self {
        Self {
            next,
            kind,
            text: text.into(),
        }
    }
}

/// Disassembly errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("no instruction at {0:#x}")]
    NoInstruction(Rva),
    #[error("the binary is not for a supported architecture")]
    UnsupportedArchitecture,
    #[error("the binary is not little endian")]
    UnsupportedEndianness,
    #[error("malformed binary: {0}")]
    Parse(#[from] ::elf::ParseError),
    #[error("disassembler backend: {0}")]
    Backend(String),
    #[error("reading binary: {0}")]
    Io(#[from] std::io::Error),
}

/// A disassembler for one binary mapped at one load address
///
/// `decode` may mutate the implementation (e.g. for caching); the symbol
/// queries are read-only.
pub trait Disassembler {
    /// Decode the instruction at the given address
    fn decode(&mut self, address: Rva) -> Result<Instruction, Error>;

    /// Function containing the address, with the offset into it
    fn function_at(&self, address: Rva) -> Option<(String, u64)>;

    /// Symbol a relocation at the given address refers to
    fn relocation_at(&self, address: Rva) -> Option<String>;

    /// Address of an exported function
    fn global_function(&self, name: &str) -> Option<Rva>;
}

impl<L, R> Disassembler for either::Either<L, R>
where
    L: Disassembler,
    R: Disassembler,
{
    fn decode(&mut self, address: Rva) -> Result<Instruction, Error> {
        either::for_both!(self, d => d.decode(address))
    }

    fn function_at(&self, address: Rva) -> Option<(String, u64)> {
        either::for_both!(self, d => d.function_at(address))
    }

    fn relocation_at(&self, address: Rva) -> Option<String> {
        either::for_both!(self, d => d.relocation_at(address))
    }

    fn global_function(&self, name: &str) -> Option<Rva> {
        either::for_both!(self, d => d.global_function(name))
    }
}

/// Create a [`Disassembler`] from a decode function
///
/// Symbol queries on the result always come up empty.
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: FnMut(Rva) -> Result<Instruction, Error>,
{
    FromFn(f)
}

/// [`Disassembler`] adapter around a decode function
pub struct FromFn<F>(F);

impl<F> Disassembler for FromFn<F>
where
    F: FnMut(Rva) -> Result<Instruction, Error>,
{
    fn decode(&mut self, address: Rva) -> Result<Instruction, Error> {
        (self.0)(address)
    }

    fn function_at(&self, _: Rva) -> Option<(String, u64)> {
        None
    }

    fn relocation_at(&self, _: Rva) -> Option<String> {
        None
    }

    fn global_function(&self, _: &str) -> Option<Rva> {
        None
    }
}

/// Create a [`Disassembler`] from address/instruction pairs
pub fn from_sorted_map(entries: impl IntoIterator<Item = (Rva, Instruction)>) -> Scripted {
    Scripted {
        instructions: entries.into_iter().collect(),
        functions: BTreeMap::new(),
        relocations: FxHashMap::default(),
    }
}

/// Map-backed [`Disassembler`]
///
/// Useful for tests and for replaying against code that was captured
/// through some channel other than an on-disk binary.
#[derive(Clone, Default)]
pub struct Scripted {
    instructions: BTreeMap<Rva, Instruction>,
    functions: BTreeMap<Rva, String>,
    relocations: FxHashMap<Rva, String>,
}

impl Scripted {
    /// Register a function symbol starting at the given address
    pub fn with_function(mut self, address: Rva, name: impl Into<String>) -> Self {
        self.functions.insert(address, name.into());
        self
    }

    /// Register a relocation slot
    pub fn with_relocation(mut self, address: Rva, name: impl Into<String>) -> Self {
        self.relocations.insert(address, name.into());
        self
    }
}

impl Disassembler for Scripted {
    fn decode(&mut self, address: Rva) -> Result<Instruction, Error> {
        self.instructions
            .get(&address)
            .cloned()
            .ok_or(Error::NoInstruction(address))
    }

    fn function_at(&self, address: Rva) -> Option<(String, u64)> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(start, name)| (name.clone(), address - start))
    }

    fn relocation_at(&self, address: Rva) -> Option<String> {
        self.relocations.get(&address).cloned()
    }

    fn global_function(&self, name: &str) -> Option<Rva> {
        self.functions
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(a, _)| *a)
    }
}

/// Supplier of [`Disassembler`]s keyed by binary identity
///
/// The replay engine asks for a handle every time the program counter
/// resolves to a binary; implementations are expected to cache.
pub trait Source {
    /// Obtain a handle for the binary at `path` loaded at `load_address`
    ///
    /// Returns `None` when the binary cannot be found or parsed; the replay
    /// treats that as loss of synchronization, not as a fatal error.
    fn obtain(&mut self, path: &str, load_address: Rva) -> Option<&mut dyn Disassembler>;

    /// Where the binary behind a target path lives on this host, if the
    /// source distinguishes the two
    fn host_location(&self, path: &str) -> Option<String> {
        let _ = path;
        None
    }
}

/// [`Source`] serving one [`Scripted`] disassembler for every binary
///
/// Models a flat address space; the test counterpart of
/// [`elf::ElfRegistry`].
pub struct ScriptedSource(pub Scripted);

impl Source for ScriptedSource {
    fn obtain(&mut self, _: &str, _: Rva) -> Option<&mut dyn Disassembler> {
        Some(&mut self.0)
    }
}
