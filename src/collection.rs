// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Collection and task indexing
//!
//! A [`Collection`] groups the per-CPU trace files and the sideband log into
//! a serializable manifest and partitions the capture into one [`Task`] per
//! traced thread. The manifest is a line-based text format that round-trips
//! byte-for-byte: serializing a deserialized manifest reproduces the input
//! exactly.

pub mod cpu;
pub mod task;


pub use task::{Block, BlockKind, Task};

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use log::info;
use thiserror::Error;

use crate::packet;
use crate::sched::Correlator;
use crate::sideband::{self, Model};
use crate::timing::Timeline;
use crate::types::Tid;

/// Manifest and setup errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("syntax error in collection: {0}")]
    Syntax(String),
    #[error("syntax error in collection: unknown tag '{0}'")]
    UnknownTag(String),
    #[error("syntax error in collection: no eof tag")]
    MissingEof,
    #[error("no scheduling quantum could be anchored for cpu {cpu}")]
    NoFirstQuantum { cpu: u32 },
    #[error("decoding trace: {0}")]
    Packet(#[from] packet::Error),
    #[error("reading sideband: {0}")]
    Sideband(#[from] sideband::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A complete capture: trace paths, sideband path and per-thread tasks
pub struct Collection {
    trace_paths: Vec<String>,
    sideband_path: String,
    tasks: BTreeMap<Tid, Task>,
}

impl Collection {
    /// Build a collection by decoding a capture
    ///
    /// Runs timestamp reconciliation and scheduling correlation for every
    /// CPU trace, then merges the resulting blocks into per-thread tasks in
    /// global timestamp order.
    pub fn build(
        sideband_path: impl AsRef<Path>,
        trace_paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<Self, Error> {
        let sideband_path = sideband_path.as_ref();
        let model = Model::build(&fs::read(sideband_path)?)?;

        let mut paths = Vec::new();
        let mut per_cpu = Vec::new();
        for (cpu, path) in trace_paths.into_iter().enumerate() {
            let path = path.as_ref();
            let cpu = cpu as u32;
            let data = fs::read(path)?;

            let mut timeline = Timeline::scan(&data)?;
            timeline.apply(&model.ratios());

            let mut correlator = Correlator::new(&model, cpu);
            correlator.apply(&data, &timeline)?;

            let blocks = cpu::build_blocks(cpu, &timeline, &correlator)?;
            info!("cpu {cpu}: {} blocks from {}", blocks.len(), path.display());
            per_cpu.push(VecDeque::from(blocks));
            paths.push(path.to_string_lossy().into_owned());
        }

        let mut collection = Self {
            trace_paths: paths,
            sideband_path: sideband_path.to_string_lossy().into_owned(),
            tasks: BTreeMap::new(),
        };
        collection.merge(per_cpu, &model);
        Ok(collection)
    }

    /// Merge per-CPU block lists into tasks in global timestamp order
    fn merge(&mut self, mut files: Vec<VecDeque<Block>>, model: &Model) {
        files.retain(|f| !f.is_empty());

        while !files.is_empty() {
            // pick the file with the lowest current timestamp and drain it
            // until it passes the runner-up
            let first = files
                .iter()
                .enumerate()
                .min_by_key(|(_, f)| f.front().unwrap().tsc.0)
                .map(|(i, _)| i)
                .unwrap();
            let runner_up = files
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != first)
                .map(|(_, f)| f.front().unwrap().tsc.0)
                .min();

            loop {
                let block = files[first].pop_front().unwrap();
                let tid = block.tid;
                self.tasks
                    .entry(tid)
                    .or_insert_with(|| Task::new(tid, model.task_name(tid)))
                    .append_block(block);

                if files[first].is_empty() {
                    files.remove(first);
                    break;
                }
                if let Some(limit) = runner_up {
                    if files[first].front().unwrap().tsc.0 > limit {
                        break;
                    }
                }
            }
        }
    }

    /// Write the manifest
    pub fn serialize(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "# {} trace files:", self.trace_paths.len())?;
        for path in &self.trace_paths {
            writeln!(out, "trace {}", quote(path))?;
        }
        writeln!(out, "# sideband file:")?;
        writeln!(out, "sideband {}", quote(&self.sideband_path))?;

        writeln!(out, "# {} traced tasks:", self.tasks.len())?;
        for task in self.tasks.values() {
            task.serialize(out)?;
        }

        writeln!(out, "eof")
    }

    /// Parse a manifest
    pub fn deserialize(input: impl BufRead) -> Result<Self, Error> {
        let mut collection = Self {
            trace_paths: Vec::new(),
            sideband_path: String::new(),
            tasks: BTreeMap::new(),
        };

        let mut lines = TaggedLines::new(input.lines());
        let mut pending = lines.next_tagged()?;
        loop {
            let Some((tag, rest)) = pending.take() else {
                return Err(Error::MissingEof);
            };
            match tag.as_str() {
                "trace" => {
                    let path =
                        dequote(&rest).ok_or_else(|| Error::Syntax("trace path".into()))?;
                    collection.trace_paths.push(path);
                    pending = lines.next_tagged()?;
                }
                "sideband" => {
                    collection.sideband_path =
                        dequote(&rest).ok_or_else(|| Error::Syntax("sideband path".into()))?;
                    pending = lines.next_tagged()?;
                }
                "task" => {
                    let (task, handback) = Task::deserialize(&mut lines, &rest)?;
                    collection.tasks.insert(task.tid(), task);
                    pending = handback;
                }
                "eof" => return Ok(collection),
                other => return Err(Error::UnknownTag(other.into())),
            }
        }
    }

    pub fn trace_paths(&self) -> &[String] {
        &self.trace_paths
    }

    pub fn sideband_path(&self) -> &str {
        &self.sideband_path
    }

    pub fn task(&self, tid: Tid) -> Option<&Task> {
        self.tasks.get(&tid)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tids(&self) -> Vec<Tid> {
        self.tasks.keys().copied().collect()
    }

    /// Earliest known timestamp across all tasks
    ///
    /// Output records are emitted relative to this value.
    pub fn earliest_tsc(&self) -> u64 {
        self.tasks
            .values()
            .filter_map(Task::earliest_tsc)
            .min()
            .unwrap_or(0)
    }

    /// Tids ordered by decreasing trace size
    ///
    /// Replaying big tasks first keeps the worker pool busy to the end.
    pub fn tids_by_decreasing_size(&self) -> Vec<Tid> {
        let mut tids: Vec<(u64, Tid)> = self
            .tasks
            .values()
            .map(|t| (t.size(), t.tid()))
            .collect();
        tids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        tids.into_iter().map(|(_, tid)| tid).collect()
    }
}

/// Line reader that skips comments and splits off the leading tag
pub(crate) struct TaggedLines<I> {
    lines: I,
}

impl<I: Iterator<Item = io::Result<String>>> TaggedLines<I> {
    fn new(lines: I) -> Self {
        Self { lines }
    }

    /// Next `(tag, rest)` pair, skipping comment and empty lines
    pub(crate) fn next_tagged(&mut self) -> Result<Option<(String, String)>, Error> {
        for line in self.lines.by_ref() {
            let line = line?;
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut parts = trimmed.splitn(2, ' ');
            let tag = parts.next().unwrap_or("").to_string();
            let rest = parts.next().unwrap_or("").trim_start().to_string();
            return Ok(Some((tag, rest)));
        }
        Ok(None)
    }
}

/// Quote a path for the manifest, escaping quotes and backslashes
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Undo [`quote`]; returns `None` on malformed input
pub(crate) fn dequote(s: &str) -> Option<String> {
    let s = s.trim();
    let mut chars = s.chars();
    if chars.next() != Some('"') {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for c in chars {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(out);
        } else {
            out.push(c);
        }
    }
    None
}
