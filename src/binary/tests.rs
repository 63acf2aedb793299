// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Disassembler seam tests

use super::*;

use std::io::Write as _;

#[test]
fn scripted_decode_and_symbols() {
    let mut d = from_sorted_map([
        (0x1000, Instruction::new(0x1002, Kind::Other, "nop")),
        (0x1002, Instruction::new(0x1003, Kind::Return, "ret")),
    ])
    .with_function(0x1000, "main")
    .with_relocation(0x2000, "malloc");

    assert_eq!(d.decode(0x1000).unwrap().kind, Kind::Other);
    assert!(matches!(d.decode(0x1001), Err(Error::NoInstruction(0x1001))));
    assert_eq!(d.function_at(0x1002), Some(("main".into(), 2)));
    assert_eq!(d.global_function("main"), Some(0x1000));
    assert_eq!(d.relocation_at(0x2000).as_deref(), Some("malloc"));
    assert_eq!(d.relocation_at(0x2001), None);
}

#[test]
fn from_fn_adapts_a_closure() {
    let mut d = from_fn(|addr| {
        if addr == 0x40 {
            Ok(Instruction::new(0x42, Kind::Other, "nop"))
        } else {
            Err(Error::NoInstruction(addr))
        }
    });
    assert_eq!(d.decode(0x40).unwrap().next, 0x42);
    assert!(d.decode(0x41).is_err());
    assert_eq!(d.function_at(0x40), None);
}

#[test]
fn either_dispatches_to_both_sides() {
    let left = from_sorted_map([(0x10, Instruction::new(0x12, Kind::Other, "nop"))]);
    let mut d: either::Either<Scripted, Scripted> = either::Either::Left(left);
    assert!(d.decode(0x10).is_ok());

    let right = from_sorted_map([(0x20, Instruction::new(0x22, Kind::Other, "nop"))]);
    let mut d: either::Either<Scripted, Scripted> = either::Either::Right(right);
    assert!(d.decode(0x20).is_ok());
    assert!(d.decode(0x10).is_err());
}

#[test]
fn kernel_map_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("System.map");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "ffffffff81000000 T startup").unwrap();
    writeln!(file, "ffffffff81000100 t helper").unwrap();
    writeln!(file, "ffffffff82000000 D some_data").unwrap();
    drop(file);

    let map = kernel::KernelMap::read(&path).unwrap();
    assert_eq!(
        map.function_at(0xffff_ffff_8100_0040),
        Some(("startup", 0x40))
    );
    assert_eq!(
        map.function_at(0xffff_ffff_8100_0100),
        Some(("helper", 0))
    );
    // data symbols are not code
    assert_eq!(map.address_of("some_data"), None);
    assert_eq!(map.address_of("helper"), Some(0xffff_ffff_8100_0100));
    assert_eq!(map.function_at(0x1000), None);
}

#[test]
fn scripted_source_serves_every_path() {
    let scripted =
        from_sorted_map([(0x10, Instruction::new(0x12, Kind::Other, "nop"))]);
    let mut source = ScriptedSource(scripted);
    assert!(source.obtain("/any/path", 0).is_some());
    assert!(source.obtain("/other", 0x4000).is_some());
}
