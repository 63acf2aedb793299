// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Sideband record encoding for tests

use super::*;

fn header(size: u32, kind: u32, tsc: u64, cpu: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&size.to_le_bytes());
    bytes.extend_from_slice(&kind.to_le_bytes());
    bytes.extend_from_slice(&tsc.to_le_bytes());
    bytes.extend_from_slice(&cpu.to_le_bytes());
    bytes
}

pub fn init(
    tsc: u64,
    cpu: u32,
    pid: i32,
    tgid: i32,
    tsc_ctc_ratio: u32,
    mtc_shift: u8,
) -> Vec<u8> {
    let mut bytes = header(HEADER_LEN as u32 + 21, KIND_INIT, tsc, cpu);
    bytes.extend_from_slice(&pid.to_le_bytes());
    bytes.extend_from_slice(&tgid.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes()); // tsc_tick
    bytes.extend_from_slice(&0u32.to_le_bytes()); // fsb_mhz
    bytes.extend_from_slice(&tsc_ctc_ratio.to_le_bytes());
    bytes.push(mtc_shift);
    bytes
}

pub fn process(tsc: u64, cpu: u32, pid: i32, tgid: i32, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&pid.to_le_bytes());
    payload.extend_from_slice(&pid.to_le_bytes()); // ppid, unused here
    payload.extend_from_slice(&tgid.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    let mut bytes = header((HEADER_LEN + payload.len()) as u32, KIND_PROCESS, tsc, cpu);
    bytes.extend(payload);
    bytes
}

pub fn mmap(tsc: u64, cpu: u32, tgid: i32, start: u64, len: u64, pgoff: u64, path: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&tgid.to_le_bytes());
    payload.extend_from_slice(&start.to_le_bytes());
    payload.extend_from_slice(&len.to_le_bytes());
    payload.extend_from_slice(&pgoff.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    let mut bytes = header((HEADER_LEN + payload.len()) as u32, KIND_MMAP, tsc, cpu);
    bytes.extend(payload);
    bytes
}

pub fn munmap(tsc: u64, cpu: u32, tgid: i32, start: u64, len: u64) -> Vec<u8> {
    let mut bytes = header(HEADER_LEN as u32 + 20, KIND_MUNMAP, tsc, cpu);
    bytes.extend_from_slice(&tgid.to_le_bytes());
    bytes.extend_from_slice(&start.to_le_bytes());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes
}

pub fn switch(
    tsc: u64,
    cpu: u32,
    prev_pid: i32,
    next_pid: i32,
    pkt_count: u32,
    trace_offset: u64,
) -> Vec<u8> {
    let mut bytes = header(HEADER_LEN as u32 + 28, KIND_SWITCH, tsc, cpu);
    bytes.extend_from_slice(&next_pid.to_le_bytes());
    bytes.extend_from_slice(&next_pid.to_le_bytes()); // tgid = pid for tests
    bytes.extend_from_slice(&prev_pid.to_le_bytes());
    bytes.extend_from_slice(&prev_pid.to_le_bytes());
    bytes.extend_from_slice(&pkt_count.to_le_bytes());
    bytes.extend_from_slice(&trace_offset.to_le_bytes());
    bytes
}

pub fn sched_addr(tsc: u64, cpu: u32, address: u64) -> Vec<u8> {
    let mut bytes = header(HEADER_LEN as u32 + 8, KIND_SCHEDADDR, tsc, cpu);
    bytes.extend_from_slice(&address.to_le_bytes());
    bytes
}

/// An unknown record kind that parsers must skip
pub fn unknown(tsc: u64, cpu: u32, payload_len: usize) -> Vec<u8> {
    let mut bytes = header((HEADER_LEN + payload_len) as u32, 0xbeef, tsc, cpu);
    bytes.extend(std::iter::repeat(0xa5).take(payload_len));
    bytes
}
