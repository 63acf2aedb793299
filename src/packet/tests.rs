// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Decoder tests

use super::decoder::SYNC_TEMPLATE;
use super::*;

fn decode_all(data: &[u8]) -> Vec<Packet> {
    let mut decoder = Decoder::new(data);
    let mut packets = Vec::new();
    loop {
        let packet = decoder.next_packet().expect("decode failure");
        if packet.kind == Packet::Eof {
            return packets;
        }
        packets.push(packet.kind);
    }
}

#[test]
fn sync_then_timing_then_resume() {
    // sync marker, coarse counter, counter-ratio pair, then a full-width
    // trace-resume address
    let mut data = SYNC_TEMPLATE.to_vec();
    data.extend_from_slice(b"\x19\x40\x02\x00\x00\x00\x00\x00");
    data.extend_from_slice(b"\x02\x73\x00\x00\x00\x00\x00");
    data.extend_from_slice(b"\x71\x00\x10\x00\x00\x00\x00");

    assert_eq!(
        decode_all(&data),
        vec![
            Packet::Psb,
            Packet::Tsc(0x240),
            Packet::Tma { ctc: 0, fast: 0 },
            Packet::TipPge(Some(0x1000)),
        ]
    );
}

#[test]
fn sync_template_deviation_is_fatal() {
    let mut data = SYNC_TEMPLATE.to_vec();
    data[7] = 0x00;
    let mut decoder = Decoder::new(&data);
    assert_eq!(
        decoder.next_packet(),
        Err(Error::BrokenSync { pos: 0 })
    );
}

#[test]
fn sync_region_flag_brackets_psb() {
    let mut data = SYNC_TEMPLATE.to_vec();
    data.extend_from_slice(b"\x59\x07");
    data.extend_from_slice(b"\x02\x23");
    let mut decoder = Decoder::new(&data);

    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Psb);
    assert!(decoder.in_sync_region());
    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Mtc(7));
    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Psbend);
    assert!(!decoder.in_sync_region());
}

#[test]
fn address_reconstruction_all_four_forms() {
    // Seed the cache with a 6-byte form, then exercise the 2-byte, 4-byte
    // and out-of-context forms against it.
    let data = b"\x6d\xaa\xbb\xcc\xdd\x7e\x00\
                 \x2d\x11\x22\
                 \x4d\x44\x33\x22\x11\
                 \x0d";
    let packets = decode_all(data);

    assert_eq!(packets[0], Packet::Tip(Some(0x7edd_ccbb_aa)));
    // low 16 bits replaced, the rest preserved
    assert_eq!(packets[1], Packet::Tip(Some(0x7edd_cc22_11)));
    // low 32 bits replaced
    assert_eq!(packets[2], Packet::Tip(Some(0x7e11_2233_44)));
    // out of context: no address, cache untouched
    assert_eq!(packets[3], Packet::Tip(None));
}

#[test]
fn address_sign_extension() {
    // 6-byte form with bit 47 set is sign-extended to a kernel address
    let data = b"\x6d\x00\x00\x00\x00\x00\xff";
    assert_eq!(
        decode_all(data),
        vec![Packet::Tip(Some(0xffff_ff00_0000_0000))]
    );
}

#[test]
fn out_of_context_preserves_cache() {
    let data = b"\x6d\x00\x00\x00\x00\x10\x00\
                 \x0d\
                 \x2d\x34\x12";
    let packets = decode_all(data);
    assert_eq!(packets[1], Packet::Tip(None));
    assert_eq!(packets[2], Packet::Tip(Some(0x10_0000_1234)));
}

#[test]
fn short_tnt_bits() {
    // 0b0110_1110: stop bit at 5, payload T N T T T (oldest first)
    let packets = decode_all(b"\x6e");
    let Packet::ShortTnt(tnt) = packets[0] else {
        panic!("expected a short TNT");
    };
    assert_eq!(tnt.len(), 5);
    assert!(tnt.bits & tnt.mask != 0);
}

#[test]
fn long_tnt_bits() {
    // stop bit in the top payload byte
    let packets = decode_all(b"\x02\xa3\x03\x00\x00\x00\x00\x80");
    let Packet::LongTnt(tnt) = packets[0] else {
        panic!("expected a long TNT");
    };
    assert_eq!(tnt.len(), 47);
}

#[test]
fn unknown_opcode_reports_position() {
    let mut decoder = Decoder::new(b"\x00\x05");
    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Pad);
    assert_eq!(
        decoder.next_packet(),
        Err(Error::UnknownOpcode {
            opcode: 0x05,
            pos: 1
        })
    );
}

#[test]
fn truncated_packet_becomes_eof() {
    // TSC needs 7 payload bytes, only 3 present
    let mut decoder = Decoder::new(b"\x19\x01\x02\x03");
    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Eof);
    assert_eq!(decoder.bytes_left(), 0);
}

#[test]
fn oversized_cyc_is_fatal() {
    let mut data = vec![0x07u8];
    data.extend(std::iter::repeat(0x01).take(15));
    let mut decoder = Decoder::new(&data);
    assert_eq!(decoder.next_packet(), Err(Error::OversizedCyc { pos: 0 }));
}

#[test]
fn cyc_length_variants() {
    // one-byte form (no exp bit) and a two-byte form
    assert_eq!(decode_all(b"\x03"), vec![Packet::Cyc]);
    assert_eq!(decode_all(b"\x07\x02"), vec![Packet::Cyc]);
}

#[test]
fn skip_to_sync_finds_template() {
    let mut data = vec![0xffu8, 0xfe, 0xfd];
    data.extend_from_slice(&SYNC_TEMPLATE);
    let mut decoder = Decoder::new(&data);
    assert_eq!(decoder.skip_to_sync(), Some(3));
    assert_eq!(decoder.next_packet().unwrap().kind, Packet::Psb);
}

#[test]
fn offset_base_is_reported() {
    let mut decoder = Decoder::new(b"\x00\x00").at_offset(0x500);
    let packet = decoder.next_packet().unwrap();
    assert_eq!(packet.pos, 0x500);
    assert_eq!(decoder.pos(), 0x501);
}

#[test]
fn extended_packet_lengths() {
    let data = b"\x02\x03\x55\x00\
                 \x02\x43\x01\x00\x00\x00\x00\x00\
                 \x02\xc8\x01\x00\x00\x00\x00\
                 \x02\xf3";
    assert_eq!(
        decode_all(data),
        vec![
            Packet::Cbr(0x55),
            Packet::Pip {
                cr3: ((0x4302u64 | (0x01 << 16)) >> 17) << 5,
                nr: true
            },
            Packet::Vmcs(0x01 << 12),
            Packet::Ovf,
        ]
    );
}
