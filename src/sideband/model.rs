// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Digested view of the sideband log

use rustc_hash::FxHashMap;

use crate::timing::ClockRatios;
use crate::types::{Rva, Tid};

use super::{parse, Error, Record};

/// One thread switch on one CPU
#[derive(Clone, Debug)]
pub struct SwitchEvent {
    pub tsc: u64,
    pub cpu: u32,
    /// Trace byte offset recorded by the capture driver at switch time
    pub trace_offset: u64,
    pub prev: Tid,
    pub next: Tid,
    pub pkt_count: u32,
}

/// One executable mapping in a process address space
#[derive(Clone, Debug)]
pub struct Mapping {
    pub start: Rva,
    pub len: u64,
    pub pgoff: u64,
    pub path: String,
    /// Timestamp the mapping appeared
    pub tsc: u64,
    /// Timestamp the mapping was removed, if it ever was
    pub unmapped: Option<u64>,
}

/// Dense thread-id assignment
///
/// Threads are keyed by their OS pid; the idle thread (pid 0) exists once
/// per CPU and gets a distinct id for each.
#[derive(Default)]
pub struct TidRegistry {
    map: FxHashMap<(i32, Option<u32>), Tid>,
    info: Vec<(i32, i32, Option<u32>)>,
}

impl TidRegistry {
    pub fn tid(&mut self, pid: i32, tgid: i32, cpu: u32) -> Tid {
        let key = if pid == 0 { (0, Some(cpu)) } else { (pid, None) };
        if let Some(tid) = self.map.get(&key) {
            return *tid;
        }
        let tid = Tid(self.info.len() as u32);
        self.info.push((pid, tgid, key.1));
        self.map.insert(key, tid);
        tid
    }

    /// OS pid, process group and (for idle threads) CPU behind a tid
    pub fn info(&self, tid: Tid) -> Option<(i32, i32, Option<u32>)> {
        self.info.get(tid.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

/// Queryable model of the whole sideband log
pub struct Model {
    ratios: ClockRatios,
    initial_tsc: u64,
    scheduler_ip: Option<Rva>,
    switches: Vec<SwitchEvent>,
    initial_tids: FxHashMap<u32, Tid>,
    process_names: FxHashMap<i32, String>,
    mappings: FxHashMap<i32, Vec<Mapping>>,
    tids: TidRegistry,
}

impl Model {
    /// Build the model from a raw sideband log
    pub fn build(data: &[u8]) -> Result<Self, Error> {
        let records = parse(data)?;

        let mut model = Model {
            ratios: ClockRatios {
                tsc_ctc_ratio: 1,
                mtc_shift: 0,
            },
            initial_tsc: records.iter().map(|(h, _)| h.tsc).min().unwrap_or(0),
            scheduler_ip: None,
            switches: Vec::new(),
            initial_tids: FxHashMap::default(),
            process_names: FxHashMap::default(),
            mappings: FxHashMap::default(),
            tids: TidRegistry::default(),
        };

        for (header, record) in records {
            match record {
                Record::Init {
                    pid,
                    tgid,
                    tsc_ctc_ratio,
                    mtc_shift,
                    ..
                } => {
                    model.ratios = ClockRatios {
                        tsc_ctc_ratio: tsc_ctc_ratio.max(1),
                        mtc_shift,
                    };
                    let tid = model.tids.tid(pid, tgid, header.cpu);
                    model.initial_tids.entry(header.cpu).or_insert(tid);
                }
                Record::Process { pid, name, .. } => {
                    model.process_names.insert(pid, name);
                }
                Record::Mmap {
                    tgid,
                    start,
                    len,
                    pgoff,
                    path,
                } => {
                    model.mappings.entry(tgid).or_default().push(Mapping {
                        start,
                        len,
                        pgoff,
                        path,
                        tsc: header.tsc,
                        unmapped: None,
                    });
                }
                Record::Munmap { tgid, start, len } => {
                    if let Some(maps) = model.mappings.get_mut(&tgid) {
                        for m in maps.iter_mut() {
                            if m.unmapped.is_none()
                                && m.start >= start
                                && m.start + m.len <= start + len
                            {
                                m.unmapped = Some(header.tsc);
                            }
                        }
                    }
                }
                Record::Switch {
                    pid,
                    tgid,
                    prev_pid,
                    prev_tgid,
                    pkt_count,
                    trace_offset,
                } => {
                    let prev = model.tids.tid(prev_pid, prev_tgid, header.cpu);
                    let next = model.tids.tid(pid, tgid, header.cpu);
                    model.initial_tids.entry(header.cpu).or_insert(prev);
                    model.switches.push(SwitchEvent {
                        tsc: header.tsc,
                        cpu: header.cpu,
                        trace_offset,
                        prev,
                        next,
                        pkt_count,
                    });
                }
                Record::SchedAddr { address } => {
                    model.scheduler_ip.get_or_insert(address);
                }
            }
        }

        model.switches.sort_by_key(|s| s.tsc);
        Ok(model)
    }

    /// Clock ratios from the initialization record
    pub fn ratios(&self) -> ClockRatios {
        self.ratios
    }

    /// Earliest raw timestamp in the log
    pub fn initial_tsc(&self) -> u64 {
        self.initial_tsc
    }

    /// Branch-target address of the scheduler's switch point
    pub fn scheduler_ip(&self) -> Option<Rva> {
        self.scheduler_ip
    }

    /// Thread running on the CPU when capture started
    pub fn initial_tid(&self, cpu: u32) -> Option<Tid> {
        self.initial_tids.get(&cpu).copied()
    }

    /// Switch events for one CPU, in timestamp order
    pub fn switches(&self, cpu: u32) -> impl Iterator<Item = &SwitchEvent> {
        self.switches.iter().filter(move |s| s.cpu == cpu)
    }

    /// All CPUs that appear in switch or initialization records
    pub fn cpus(&self) -> Vec<u32> {
        let mut cpus: Vec<u32> = self
            .switches
            .iter()
            .map(|s| s.cpu)
            .chain(self.initial_tids.keys().copied())
            .collect();
        cpus.sort_unstable();
        cpus.dedup();
        cpus
    }

    /// Human-readable name for a traced thread
    pub fn task_name(&self, tid: Tid) -> String {
        let Some((pid, tgid, cpu)) = self.tids.info(tid) else {
            return "unknown".into();
        };
        if pid == 0 {
            return format!("swapper/{}", cpu.unwrap_or(0));
        }
        self.process_names
            .get(&pid)
            .or_else(|| self.process_names.get(&tgid))
            .cloned()
            .unwrap_or_else(|| "unknown".into())
    }

    /// Resolve the binary containing an address for a thread at a time
    ///
    /// Returns the mapped path and the module load address (mapping start
    /// corrected by the file offset).
    pub fn target_path(&self, tid: Tid, address: Rva, tsc: u64) -> Option<(&str, Rva)> {
        let (_, tgid, _) = self.tids.info(tid)?;
        let maps = self.mappings.get(&tgid)?;
        maps.iter()
            .filter(|m| {
                m.tsc <= tsc
                    && m.unmapped.map(|u| u > tsc).unwrap_or(true)
                    && address >= m.start
                    && address < m.start + m.len
            })
            .max_by_key(|m| m.tsc)
            .map(|m| (m.path.as_str(), m.start.saturating_sub(m.pgoff)))
    }

    /// Visit every binary mapped for a thread at a time
    ///
    /// Used by indirect-relocation resolution to scan other modules for an
    /// exported symbol. The callback returns `true` to stop the iteration.
    pub fn for_each_target_path(
        &self,
        tid: Tid,
        tsc: u64,
        mut callback: impl FnMut(&str, Rva) -> bool,
    ) {
        let Some((_, tgid, _)) = self.tids.info(tid) else {
            return;
        };
        let Some(maps) = self.mappings.get(&tgid) else {
            return;
        };
        for m in maps {
            if m.tsc <= tsc && m.unmapped.map(|u| u > tsc).unwrap_or(true) {
                if callback(&m.path, m.start.saturating_sub(m.pgoff)) {
                    return;
                }
            }
        }
    }

    /// The thread-id registry backing this model
    pub fn tids(&self) -> &TidRegistry {
        &self.tids
    }
}
