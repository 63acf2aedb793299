// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Sideband parser and model tests

use super::testutil;
use super::*;

fn log(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

#[test]
fn parse_roundtrip_of_known_records() {
    let data = log(&[
        testutil::init(100, 0, 1, 1, 79, 9),
        testutil::process(101, 0, 7, 7, "renderer"),
        testutil::mmap(102, 0, 7, 0x400000, 0x2000, 0, "/usr/bin/renderer"),
        testutil::switch(110, 0, 1, 7, 5, 0x40),
        testutil::sched_addr(90, 0, 0xffff_ffff_8100_0000),
    ]);

    let records = parse(&data).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(
        records[0].1,
        Record::Init {
            pid: 1,
            tgid: 1,
            tsc_tick: 0,
            fsb_mhz: 0,
            tsc_ctc_ratio: 79,
            mtc_shift: 9,
        }
    );
    assert_eq!(records[1].0.tsc, 101);
    match &records[2].1 {
        Record::Mmap { path, start, .. } => {
            assert_eq!(path, "/usr/bin/renderer");
            assert_eq!(*start, 0x400000);
        }
        other => panic!("unexpected record {other:?}"),
    }
}

#[test]
fn unknown_records_are_skipped() {
    let data = log(&[
        testutil::unknown(50, 0, 33),
        testutil::switch(60, 0, 0, 7, 1, 0x10),
    ]);
    let records = parse(&data).unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].1, Record::Switch { .. }));
}

#[test]
fn truncated_record_is_an_error() {
    let mut data = testutil::switch(60, 0, 0, 7, 1, 0x10);
    data.truncate(data.len() - 4);
    assert!(matches!(parse(&data), Err(Error::Truncated(_))));
}

#[test]
fn model_digests_switches_per_cpu() {
    let data = log(&[
        testutil::init(100, 0, 0, 0, 79, 9),
        testutil::switch(110, 0, 0, 7, 1, 0x40),
        testutil::switch(120, 1, 0, 8, 1, 0x80),
        testutil::switch(130, 0, 7, 0, 2, 0xc0),
    ]);
    let model = Model::build(&data).unwrap();

    assert_eq!(model.cpus(), vec![0, 1]);
    let cpu0: Vec<_> = model.switches(0).collect();
    assert_eq!(cpu0.len(), 2);
    assert_eq!(cpu0[0].trace_offset, 0x40);
    assert_eq!(cpu0[1].prev, cpu0[0].next);
    assert_eq!(model.initial_tsc(), 100);
    assert_eq!(model.ratios().tsc_ctc_ratio, 79);
}

#[test]
fn idle_threads_are_per_cpu() {
    let data = log(&[
        testutil::switch(110, 0, 0, 7, 1, 0),
        testutil::switch(120, 1, 0, 7, 1, 0),
    ]);
    let model = Model::build(&data).unwrap();
    let cpu0_idle = model.switches(0).next().unwrap().prev;
    let cpu1_idle = model.switches(1).next().unwrap().prev;
    assert_ne!(cpu0_idle, cpu1_idle);
    assert!(model.task_name(cpu0_idle).starts_with("swapper/"));
}

#[test]
fn target_path_respects_time_and_unmap() {
    let data = log(&[
        testutil::process(90, 0, 7, 7, "renderer"),
        testutil::mmap(100, 0, 7, 0x1000, 0x1000, 0, "/lib/old.so"),
        testutil::munmap(200, 0, 7, 0x1000, 0x1000),
        testutil::mmap(210, 0, 7, 0x1000, 0x1000, 0, "/lib/new.so"),
        testutil::switch(220, 0, 0, 7, 1, 0),
    ]);
    let model = Model::build(&data).unwrap();
    let tid = model.switches(0).next().unwrap().next;

    assert_eq!(
        model.target_path(tid, 0x1800, 150).map(|(p, _)| p),
        Some("/lib/old.so")
    );
    assert_eq!(
        model.target_path(tid, 0x1800, 300).map(|(p, _)| p),
        Some("/lib/new.so")
    );
    assert_eq!(model.target_path(tid, 0x9000, 150), None);
}

#[test]
fn load_address_subtracts_file_offset() {
    let data = log(&[
        testutil::mmap(100, 0, 7, 0x5000, 0x1000, 0x2000, "/lib/x.so"),
        testutil::switch(110, 0, 0, 7, 1, 0),
    ]);
    let model = Model::build(&data).unwrap();
    let tid = model.switches(0).next().unwrap().next;
    assert_eq!(model.target_path(tid, 0x5800, 150), Some(("/lib/x.so", 0x3000)));
}

#[test]
fn task_names_come_from_process_records() {
    let data = log(&[
        testutil::process(90, 0, 7, 7, "renderer"),
        testutil::switch(110, 0, 0, 7, 1, 0),
    ]);
    let model = Model::build(&data).unwrap();
    let tid = model.switches(0).next().unwrap().next;
    assert_eq!(model.task_name(tid), "renderer");
}
