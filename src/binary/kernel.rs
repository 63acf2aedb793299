// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Kernel symbol map
//!
//! Kernel addresses do not show up in the sideband mmap timeline; they are
//! resolved against a `System.map` style symbol listing plus a fixed kernel
//! image path.

use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::types::Rva;

/// Sorted kernel text symbols
#[derive(Default)]
pub struct KernelMap {
    symbols: Vec<(Rva, String)>,
}

impl KernelMap {
    /// Read a `System.map` style file: `address type name` per line
    ///
    /// Only text symbols (`T`, `t`, `W`, `w`) are kept.
    pub fn read(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut symbols = Vec::new();
        for line in BufReader::new(std::fs::File::open(path)?).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(address), Some(kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !matches!(kind, "T" | "t" | "W" | "w") {
                continue;
            }
            let Ok(address) = Rva::from_str_radix(address, 16) else {
                continue;
            };
            symbols.push((address, name.to_string()));
        }
        symbols.sort_by_key(|(a, _)| *a);
        Ok(Self { symbols })
    }

    /// Function containing the address, with the offset into it
    pub fn function_at(&self, address: Rva) -> Option<(&str, u64)> {
        let i = self.symbols.partition_point(|(a, _)| *a <= address);
        self.symbols[..i]
            .last()
            .map(|(a, name)| (name.as_str(), address - a))
    }

    /// Address of a kernel symbol
    pub fn address_of(&self, name: &str) -> Option<Rva> {
        self.symbols
            .iter()
            .find(|(_, n)| n == name)
            .map(|(a, _)| *a)
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
