// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Symbol interning
//!
//! Output records refer to functions and binaries by small dense ids. The
//! id assignment must be stable across every worker of a run, so the
//! file-backed [`SharedTable`] keeps the table in an append-only file
//! guarded by an advisory lock: to intern a missing name, a worker locks
//! the file, re-reads entries appended by others since its last look,
//! appends its own if the name is still missing, and unlocks. Ids are
//! monotonic and the first writer wins on duplicates.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs4::fs_std::FileExt;
use rustc_hash::FxHashMap;

/// In-memory interning table
///
/// Ids are dense and start at 1.
#[derive(Default)]
pub struct Interner {
    map: FxHashMap<String, u32>,
}

impl Interner {
    /// Intern a name, returning its id and whether it was new
    pub fn intern(&mut self, name: &str) -> (u32, bool) {
        if let Some(id) = self.map.get(name) {
            return (*id, false);
        }
        let id = self.map.len() as u32 + 1;
        self.map.insert(name.to_string(), id);
        (id, true)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn insert_existing(&mut self, name: &str, id: u32) {
        self.map.entry(name.to_string()).or_insert(id);
    }
}

/// File-backed interning table shared between workers
///
/// One `id|name` line per symbol.
pub struct SharedTable {
    interner: Interner,
    file: File,
    read_pos: u64,
}

impl SharedTable {
    /// Create or truncate the table file
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            interner: Interner::default(),
            file,
            read_pos: 0,
        })
    }

    /// Open an existing table file, reading entries written so far
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut table = Self {
            interner: Interner::default(),
            file,
            read_pos: 0,
        };
        table.refresh()?;
        Ok(table)
    }

    /// Intern a name, returning its id and whether this worker added it
    pub fn intern(&mut self, name: &str) -> io::Result<(u32, bool)> {
        if let Some(id) = self.interner.get(name) {
            return Ok((id, false));
        }

        self.file.lock_exclusive()?;
        let result = self.intern_locked(name);
        let unlock = FileExt::unlock(&self.file);
        let result = result?;
        unlock?;
        Ok(result)
    }

    fn intern_locked(&mut self, name: &str) -> io::Result<(u32, bool)> {
        self.refresh()?;
        if let Some(id) = self.interner.get(name) {
            return Ok((id, false));
        }

        let (id, _) = self.interner.intern(name);
        self.file.seek(SeekFrom::End(0))?;
        writeln!(self.file, "{id}|{name}")?;
        self.file.flush()?;
        self.read_pos = self.file.stream_position()?;
        Ok((id, true))
    }

    /// Record a name under an id assigned elsewhere
    ///
    /// Used for side tables whose ids are owned by another table (e.g. the
    /// host-path table keyed by module id).
    pub fn record(&mut self, id: u32, name: &str) -> io::Result<()> {
        if self.interner.get(name).is_some() {
            return Ok(());
        }
        self.file.lock_exclusive()?;
        let result = self.record_locked(id, name);
        let unlock = FileExt::unlock(&self.file);
        result?;
        unlock?;
        Ok(())
    }

    fn record_locked(&mut self, id: u32, name: &str) -> io::Result<()> {
        self.refresh()?;
        if self.interner.get(name).is_some() {
            return Ok(());
        }
        self.interner.insert_existing(name, id);
        self.file.seek(SeekFrom::End(0))?;
        writeln!(self.file, "{id}|{name}")?;
        self.file.flush()?;
        self.read_pos = self.file.stream_position()?;
        Ok(())
    }

    /// Pick up entries appended by other workers
    fn refresh(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.read_pos))?;
        let mut appended = String::new();
        self.file.read_to_string(&mut appended)?;
        self.read_pos += appended.len() as u64;

        for line in appended.lines() {
            let Some((id, name)) = line.split_once('|') else {
                continue;
            };
            if let Ok(id) = id.parse() {
                self.interner.insert_existing(name, id);
            }
        }
        Ok(())
    }
}

/// An interning table that may or may not be shared with other workers
///
/// A solo run (or a test) can stay in memory; parallel workers point at the
/// same on-disk table.
pub enum Table {
    Local(Interner),
    Shared(SharedTable),
}

impl Default for Table {
    fn default() -> Self {
        Self::Local(Interner::default())
    }
}

impl Table {
    /// Intern a name, returning its id and whether it was new
    pub fn intern(&mut self, name: &str) -> io::Result<(u32, bool)> {
        match self {
            Self::Local(interner) => Ok(interner.intern(name)),
            Self::Shared(table) => table.intern(name),
        }
    }
}
