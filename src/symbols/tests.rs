// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Interning tests

use super::*;

#[test]
fn ids_are_dense_from_one() {
    let mut interner = Interner::default();
    assert_eq!(interner.intern("alpha"), (1, true));
    assert_eq!(interner.intern("beta"), (2, true));
    assert_eq!(interner.intern("alpha"), (1, false));
    assert_eq!(interner.len(), 2);
}

#[test]
fn shared_table_appends_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("symbols");

    let mut table = SharedTable::create(&path).unwrap();
    assert_eq!(table.intern("alpha").unwrap(), (1, true));
    assert_eq!(table.intern("beta").unwrap(), (2, true));
    assert_eq!(table.intern("alpha").unwrap(), (1, false));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "1|alpha\n2|beta\n");

    let mut reopened = SharedTable::open(&path).unwrap();
    assert_eq!(reopened.intern("beta").unwrap(), (2, false));
    assert_eq!(reopened.intern("gamma").unwrap(), (3, true));
}

#[test]
fn first_writer_wins_across_tables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("symbols");

    let mut a = SharedTable::create(&path).unwrap();
    let mut b = SharedTable::open(&path).unwrap();

    assert_eq!(a.intern("alpha").unwrap(), (1, true));
    // b has not seen alpha yet; the locked refresh must pick it up instead
    // of assigning a fresh id
    assert_eq!(b.intern("alpha").unwrap(), (1, false));
    assert_eq!(b.intern("beta").unwrap(), (2, true));
    assert_eq!(a.intern("beta").unwrap(), (2, false));
}
