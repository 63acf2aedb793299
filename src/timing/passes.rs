// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! The four reconciliation passes
//!
//! Each pass walks the position-ordered item sequence once. Pass 1 anchors
//! ratio items to the coarse counter and marks confirmable ratio pairs
//! complete; pass 2 propagates rollover-bit corrections outward from the
//! first complete ratio item; pass 3 interpolates compressed-counter items
//! inside short ratio intervals and counts rollovers in long ones; pass 4
//! fills rollover-exact blocks and the open-ended tail.

use super::{ClockRatios, Pass, TimingItem, TimingKind};

/// Anchor ratio items and mark confirmable pairs complete
pub(super) fn first(items: &mut [TimingItem], ratios: &ClockRatios) {
    let mut first_tma: Option<usize> = None;
    let mut last_tsc: Option<u64> = None;
    let mut mtc_count = 0u64;
    let mut mtc_gaps = false;
    let mut last_mtc: Option<u8> = None;

    for i in 0..items.len() {
        match items[i].kind {
            TimingKind::Tsc => last_tsc = Some(items[i].tsc),
            TimingKind::Tma => {
                if let Some(tsc) = last_tsc {
                    items[i].tsc = tsc;
                    items[i].mtc = ratios.mtc_of_ctc(items[i].ctc);
                    let next_ctc = items[i].ctc.wrapping_add(1);
                    let ticks_to_next_mtc =
                        (1u32 << ratios.mtc_shift).wrapping_sub(u32::from(next_ctc & 0x1ff));
                    items[i].tsc_in_next_mtc = tsc
                        .wrapping_add(u64::from(items[i].fast))
                        .wrapping_add(
                            u64::from(ticks_to_next_mtc)
                                .wrapping_mul(u64::from(ratios.tsc_ctc_ratio)),
                        );

                    if let Some(last) = last_mtc {
                        if last != items[i].mtc {
                            mtc_gaps = true;
                        }
                    }

                    if let Some(f) = first_tma {
                        let predicted = items[i].tsc.wrapping_sub(items[f].tsc)
                            / ratios.ticks_per_mtc();
                        items[f].mtc_count = predicted;
                        if !mtc_gaps && mtc_count != 0 && predicted + 1 >= mtc_count {
                            items[f].pass = Pass::Complete;
                        }
                    }
                }
                first_tma = Some(i);
                mtc_count = 0;
                last_mtc = None;
                mtc_gaps = false;
            }
            TimingKind::Mtc => {
                match last_mtc {
                    None => {
                        if let Some(f) = first_tma {
                            // int arithmetic: a rollover counts as a gap here
                            if u16::from(items[f].mtc) + 1 != u16::from(items[i].mtc) {
                                mtc_gaps = true;
                            }
                        }
                    }
                    Some(last) => {
                        if u16::from(last) + 1 != u16::from(items[i].mtc) {
                            mtc_gaps = true;
                        }
                    }
                }
                last_mtc = Some(items[i].mtc);
                mtc_count += 1;
            }
            TimingKind::Ovf => (),
        }
    }
}

/// Fix the rollover bit of unconfirmed ratio items
///
/// Starting from the first complete ratio item, walk backward and then
/// forward, comparing each neighbor's compressed-counter value against the
/// value implied by the known-good anchor and setting the high bit where
/// the difference exceeds the drift margin.
pub(super) fn second(items: &mut [TimingItem]) {
    let Some(anchor) = items
        .iter()
        .position(|t| t.kind == TimingKind::Tma && t.pass != Pass::Unresolved)
    else {
        return;
    };

    // backward: the anchor confirms its predecessors one by one
    let mut known = anchor;
    for i in (0..anchor).rev() {
        if items[i].kind == TimingKind::Tma && items[i].tsc != 0 {
            let implied = items[known].mtc.wrapping_sub(items[i].mtc_count as u8);
            adjust_rollover_bit(&mut items[i], implied);
            known = i;
        }
    }

    // forward: each corrected item becomes the anchor for the next
    let mut known = anchor;
    for i in anchor + 1..items.len() {
        if items[i].kind == TimingKind::Tma && items[i].tsc != 0 {
            if items[i].pass == Pass::Unresolved {
                let implied = items[known].mtc.wrapping_add(items[known].mtc_count as u8);
                adjust_rollover_bit(&mut items[i], implied);
            }
            known = i;
        }
    }
}

/// Set the high bit when the implied value disagrees beyond the drift margin
fn adjust_rollover_bit(item: &mut TimingItem, implied: u8) {
    let diff = implied.max(item.mtc) - implied.min(item.mtc);
    if diff > 10 {
        item.mtc |= 0x80;
    }
    item.pass = Pass::Corrected;
}

/// Interpolate compressed-counter items inside short ratio intervals
///
/// Intervals whose predicted counter delta stays below the rollover
/// threshold get per-item extrapolated timestamps; items that would
/// overtake the closing ratio item arrived impossibly early and are
/// removed. Longer intervals only have their counter decreases counted;
/// when the count matches the prediction the block is marked exact for
/// pass 4.
pub(super) fn third(items: &mut Vec<TimingItem>, ratios: &ClockRatios) {
    let mut removed = vec![false; items.len()];
    let mut first_tma: Option<usize> = None;
    let mut second_tma: Option<usize> = None;
    let mut last_mtc: Option<u8> = None;
    let mut stepbacks = 0u64;

    for i in 0..items.len() {
        match items[i].kind {
            TimingKind::Tma => {
                if let (Some(f), Some(_)) = (first_tma, second_tma) {
                    if items[f].mtc_count >= 0xff {
                        if let Some(last) = last_mtc {
                            if last > items[i].mtc {
                                stepbacks += 1;
                            }
                        }
                        let rollovers = items[f].mtc_count / 0xff;
                        if rollovers == stepbacks {
                            items[f].known_rollovers = true;
                        }
                    }
                }

                first_tma = Some(i);
                second_tma = items[i + 1..]
                    .iter()
                    .position(|t| t.kind == TimingKind::Tma)
                    .map(|d| i + 1 + d);
                stepbacks = 0;
            }
            TimingKind::Mtc => {
                if let (Some(f), Some(s)) = (first_tma, second_tma) {
                    if items[f].pass != Pass::Unresolved {
                        if items[f].mtc_count < 0xff {
                            let next_from_tma = items[f].mtc.wrapping_add(1);
                            let delta = items[i].mtc.wrapping_sub(next_from_tma);
                            let tsc = items[f].tsc_in_next_mtc.wrapping_add(
                                u64::from(delta).wrapping_mul(ratios.ticks_per_mtc()),
                            );
                            items[i].tsc = tsc;
                            items[i].pass = Pass::Extrapolated;
                            if tsc > items[s].tsc {
                                removed[i] = true;
                            }
                        } else if let Some(last) = last_mtc {
                            if last > items[i].mtc {
                                stepbacks += 1;
                            }
                        } else if items[f].mtc > items[i].mtc {
                            stepbacks += 1;
                        }
                    }
                }
                last_mtc = Some(items[i].mtc);
            }
            _ => (),
        }
    }

    let mut keep = removed.iter().map(|r| !r);
    items.retain(|_| keep.next().unwrap());
}

/// Fill rollover-exact blocks and the open-ended tail
pub(super) fn fourth(items: &mut Vec<TimingItem>, ratios: &ClockRatios) {
    let mut removed = vec![false; items.len()];
    let mut first_tma: Option<usize> = None;
    let mut second_tma: Option<usize> = None;

    for i in 0..items.len() {
        match items[i].kind {
            TimingKind::Tma => {
                first_tma = Some(i);
                second_tma = None;
                if items[i].known_rollovers {
                    second_tma = items[i + 1..]
                        .iter()
                        .position(|t| t.kind == TimingKind::Tma)
                        .map(|d| i + 1 + d);
                }
            }
            TimingKind::Mtc => {
                if let (Some(f), Some(s)) = (first_tma, second_tma) {
                    if items[f].known_rollovers {
                        let next_from_tma = items[f].mtc.wrapping_add(1);
                        let delta = items[i].mtc.wrapping_sub(next_from_tma);
                        let tsc = items[f]
                            .tsc_in_next_mtc
                            .wrapping_add(u64::from(delta).wrapping_mul(ratios.ticks_per_mtc()));
                        items[i].tsc = tsc;
                        items[i].pass = Pass::Rollover;
                        if tsc > items[s].tsc {
                            removed[i] = true;
                        }
                    }
                } else if let Some(f) = first_tma {
                    if second_tma.is_none() && items[i].pass == Pass::Unresolved {
                        // past the last confirmable ratio item; no discard
                        // rule applies out here
                        let next_from_tma = items[f].mtc.wrapping_add(1);
                        let delta = items[i].mtc.wrapping_sub(next_from_tma);
                        items[i].tsc = items[f]
                            .tsc_in_next_mtc
                            .wrapping_add(u64::from(delta).wrapping_mul(ratios.ticks_per_mtc()));
                        items[i].pass = Pass::Tail;
                    }
                }
            }
            _ => (),
        }
    }

    let mut keep = removed.iter().map(|r| !r);
    items.retain(|_| keep.next().unwrap());
}
