// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Reconciliation tests

use super::*;

use crate::packet::decoder::SYNC_TEMPLATE;

// ratio 1, shift 9: one compressed-counter step covers 512 coarse ticks
const RATIOS: ClockRatios = ClockRatios {
    tsc_ctc_ratio: 1,
    mtc_shift: 9,
};

fn tsc(value: u64) -> Vec<u8> {
    let mut bytes = vec![0x19];
    bytes.extend_from_slice(&value.to_le_bytes()[..7]);
    bytes
}

fn tma(ctc: u16, fast: u16) -> Vec<u8> {
    let mut bytes = vec![0x02, 0x73];
    bytes.extend_from_slice(&ctc.to_le_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&fast.to_le_bytes());
    bytes
}

fn mtc(value: u8) -> Vec<u8> {
    vec![0x59, value]
}

fn stream(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

fn mtcs(timeline: &Timeline) -> Vec<&TimingItem> {
    timeline
        .items()
        .iter()
        .filter(|t| t.kind == TimingKind::Mtc)
        .collect()
}

#[test]
fn ratio_item_resolves_to_coarse_value() {
    let mut data = SYNC_TEMPLATE.to_vec();
    data.extend(tsc(0x1234_5000));
    data.extend(tma(0, 0));

    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let ratio_item = timeline
        .items()
        .iter()
        .find(|t| t.kind == TimingKind::Tma)
        .unwrap();
    assert_eq!(ratio_item.tsc, 0x1234_5000);
}

#[test]
fn complete_block_is_interpolated() {
    let data = stream(&[
        tsc(0x10000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        mtc(3),
        tsc(0x10700),
        tma(3 << 9, 0),
    ]);

    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let first_ratio = timeline
        .items()
        .iter()
        .find(|t| t.kind == TimingKind::Tma)
        .unwrap();
    assert_eq!(first_ratio.pass, Pass::Complete);
    assert_eq!(first_ratio.tsc_in_next_mtc, 0x101ff);

    let counters = mtcs(&timeline);
    assert_eq!(counters.len(), 3);
    assert_eq!(counters[0].tsc, 0x101ff);
    assert_eq!(counters[1].tsc, 0x103ff);
    assert_eq!(counters[2].tsc, 0x105ff);
    assert!(counters.iter().all(|t| t.pass == Pass::Extrapolated));
}

#[test]
fn overtaking_counter_is_discarded() {
    // the third counter extrapolates past the closing ratio item's
    // timestamp and must be dropped from the sequence
    let data = stream(&[
        tsc(0x10000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        mtc(3),
        tsc(0x10400),
        tma(3 << 9, 0),
    ]);

    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let counters = mtcs(&timeline);
    assert_eq!(counters.len(), 2);
    assert_eq!(counters[1].tsc, 0x103ff);
}

#[test]
fn counters_between_coarse_and_ratio_are_suppressed() {
    let data = stream(&[tsc(0x10000), mtc(9), mtc(10), tma(0, 0), mtc(1)]);
    let timeline = Timeline::scan(&data).unwrap();
    assert_eq!(mtcs(&timeline).len(), 1);
}

#[test]
fn counters_inside_sync_bracket_are_suppressed() {
    let mut data = SYNC_TEMPLATE.to_vec();
    data.extend(mtc(5));
    data.extend_from_slice(b"\x02\x23");
    data.extend(mtc(6));
    let timeline = Timeline::scan(&data).unwrap();
    let counters = mtcs(&timeline);
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].mtc, 6);
}

#[test]
fn rollover_block_is_counted_and_filled() {
    let data = stream(&[
        // confirmable head block
        tsc(0x20000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        tsc(0x20500),
        tma(2 << 9, 0),
        // long block with one counter wrap
        mtc(254),
        mtc(255),
        mtc(0),
        tsc(0x40500),
        tma(0, 0),
    ]);

    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let ratio_items: Vec<_> = timeline
        .items()
        .iter()
        .filter(|t| t.kind == TimingKind::Tma)
        .collect();
    assert_eq!(ratio_items[0].pass, Pass::Complete);
    assert_eq!(ratio_items[1].pass, Pass::Corrected);
    assert!(ratio_items[1].known_rollovers);

    let counters = mtcs(&timeline);
    let wrapped: Vec<_> = counters
        .iter()
        .filter(|t| t.pass == Pass::Rollover)
        .collect();
    assert_eq!(wrapped.len(), 3);
    assert_eq!(wrapped[0].tsc, 0x206ff + 251 * 512);
    assert_eq!(wrapped[2].tsc, 0x206ff + 253 * 512);
}

#[test]
fn tail_counters_get_timestamps() {
    let data = stream(&[tsc(0x10000), tma(0, 0), mtc(1), mtc(2)]);
    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let counters = mtcs(&timeline);
    assert_eq!(counters[0].pass, Pass::Tail);
    assert_eq!(counters[0].tsc, 0x101ff);
    assert_eq!(counters[1].tsc, 0x103ff);
}

#[test]
fn resolved_timestamps_are_monotonic() {
    let data = stream(&[
        tsc(0x10000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        mtc(3),
        tsc(0x10700),
        tma(3 << 9, 0),
        mtc(4),
        mtc(5),
    ]);

    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let mut last = 0;
    for item in mtcs(&timeline) {
        if item.pass != Pass::Unresolved && item.tsc != 0 {
            assert!(item.tsc > last, "timestamp stepped back at {:#x}", item.pos);
            last = item.tsc;
        }
    }
}

#[test]
fn bracket_lookups() {
    let data = stream(&[
        tsc(0x10000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        mtc(3),
        tsc(0x10700),
        tma(3 << 9, 0),
    ]);
    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    // between the second and third counters
    let bracket = timeline.bracket(0x12).unwrap();
    assert_eq!(bracket.begin, 0x103ff);
    assert_eq!(bracket.end, 0x105ff);

    // before any resolved item
    assert_eq!(timeline.bracket(0).map(|b| b.begin), Some(0x10000));

    let wide = timeline.wide_bracket(0x12).unwrap();
    assert_eq!(wide.begin, 0x101ff);
    assert_eq!(wide.end, 0x10700);
}

#[test]
fn next_resolved_skips_unresolved() {
    let data = stream(&[mtc(7), tsc(0x9000), tma(0, 0)]);
    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    // the leading counter has no timestamp; the coarse item does
    assert_eq!(timeline.next_resolved(0), Some((2, 0x9000)));
}

#[test]
fn start_points_are_indexed() {
    let mut data = SYNC_TEMPLATE.to_vec();
    data.extend(tsc(0x9000));
    data.extend_from_slice(b"\x02\xf3"); // overflow
    data.extend_from_slice(b"\x31\x00\x10"); // trace resume (2-byte form)

    let timeline = Timeline::scan(&data).unwrap();
    // sync at 0, overflow at 24, resume at 26
    assert_eq!(timeline.last_sync(0), 0);
    assert_eq!(timeline.last_sync(100), 26);
    assert_eq!(timeline.last_sync(25), 24);
    assert_eq!(timeline.last_sync(23), 0);
}

#[test]
fn timed_blocks_coalesce() {
    let data = stream(&[
        mtc(200), // unresolved head
        tsc(0x10000),
        tma(0, 0),
        mtc(1),
        mtc(2),
        tsc(0x10700),
        tma(3 << 9, 0),
    ]);
    let mut timeline = Timeline::scan(&data).unwrap();
    timeline.apply(&RATIOS);

    let blocks = timeline.timed_blocks();
    assert!(!blocks.is_empty());
    let timed: Vec<_> = blocks.iter().filter(|b| b.has_tsc).collect();
    assert!(!timed.is_empty());
    for block in &blocks {
        assert!(block.pos.0 < block.pos.1);
    }
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].pos.1, pair[1].pos.0);
    }
}
